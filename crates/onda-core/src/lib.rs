//! onda-core: Shared types for the Onda audio engine
//!
//! This crate provides the foundational vocabulary used across all Onda crates.

mod error;
mod ids;
mod layout;

pub use error::*;
pub use ids::*;
pub use layout::*;

/// Sample type on the render path.
///
/// Source generation, channel mapping and submix accumulation all run in
/// 32-bit float; wave assets decode to the same format.
pub type Sample = f32;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz22050 = 22050,
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz192000 = 192000,
}

impl SampleRate {
    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_f32(self) -> f32 {
        self as u32 as f32
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}

/// Render block size options (frames per render callback)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum BlockSize {
    Frames64 = 64,
    Frames128 = 128,
    Frames256 = 256,
    Frames512 = 512,
    Frames1024 = 1024,
    Frames2048 = 2048,
}

impl BlockSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as u32 as usize
    }

    /// Calculate block latency in milliseconds
    #[inline]
    pub fn latency_ms(self, sample_rate: SampleRate) -> f64 {
        (self.as_usize() as f64 / sample_rate.as_f64()) * 1000.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::Frames512
    }
}
