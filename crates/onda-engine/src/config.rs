//! Engine configuration.
//!
//! Everything the render pipeline keys its behavior on lives here as an
//! explicit field with a validated default; there is no global tuning state.

use onda_core::{BlockSize, ChannelLayout, OndaError, OndaResult, SampleRate};
use serde::{Deserialize, Serialize};

/// What the render thread writes while a source waits on a late decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunMode {
    /// Zero-fill until the next chunk lands.
    #[default]
    Silence,
    /// Repeat the last rendered frame (trades tonal smear for fewer gaps).
    HoldLastFrame,
}

/// Source mixing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Output sample rate
    pub sample_rate: SampleRate,

    /// Frames rendered per block
    pub block_size: BlockSize,

    /// Fixed number of source slots
    pub num_sources: usize,

    /// Render worker threads for source generation (0 or 1 = serial)
    pub num_source_workers: usize,

    /// Decode pool worker threads
    pub num_decode_workers: usize,

    /// Frames a chunk decodes at a time
    pub chunk_frames: usize,

    /// Fade length applied by `stop_fade` when the caller passes no length
    pub stop_fade_frames: u32,

    /// Azimuth delta (degrees) below which a speaker map is not recomputed
    pub azimuth_epsilon_degrees: f32,

    /// Behavior while a source is starved of decoded audio
    pub underrun_mode: UnderrunMode,

    /// Disable object-based (HRTF) spatialization engine-wide
    pub disable_hrtf: bool,

    /// Envelope follower attack (ms)
    pub envelope_attack_ms: f32,

    /// Envelope follower release (ms)
    pub envelope_release_ms: f32,

    /// Layout of the device-facing default submix
    pub device_layout: ChannelLayout,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            block_size: BlockSize::Frames512,
            num_sources: 32,
            num_source_workers: 0,
            num_decode_workers: 2,
            chunk_frames: 8192,
            stop_fade_frames: 512,
            azimuth_epsilon_degrees: 0.01,
            underrun_mode: UnderrunMode::Silence,
            disable_hrtf: false,
            envelope_attack_ms: 10.0,
            envelope_release_ms: 100.0,
            device_layout: ChannelLayout::Stereo,
        }
    }
}

impl EngineConfig {
    /// Small-block preset for latency-sensitive titles.
    pub fn low_latency() -> Self {
        Self {
            block_size: BlockSize::Frames128,
            chunk_frames: 4096,
            stop_fade_frames: 128,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> OndaResult<()> {
        if self.num_sources == 0 {
            return Err(OndaError::InvalidParam("num_sources must be > 0".into()));
        }
        if self.chunk_frames < self.block_size.as_usize() {
            return Err(OndaError::InvalidParam(format!(
                "chunk_frames {} smaller than block size {}",
                self.chunk_frames,
                self.block_size.as_usize()
            )));
        }
        if self.stop_fade_frames == 0 {
            return Err(OndaError::InvalidParam("stop_fade_frames must be > 0".into()));
        }
        if !self.azimuth_epsilon_degrees.is_finite() || self.azimuth_epsilon_degrees < 0.0 {
            return Err(OndaError::InvalidParam(
                "azimuth_epsilon_degrees must be finite and >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Decode worker count with 0 mapped to a machine-derived default.
    pub fn effective_decode_workers(&self) -> usize {
        if self.num_decode_workers == 0 {
            (num_cpus::get() / 4).max(1)
        } else {
            self.num_decode_workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_sources() {
        let cfg = EngineConfig {
            num_sources: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_chunks() {
        let cfg = EngineConfig {
            chunk_frames: 64,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_decode_worker_fallback() {
        let cfg = EngineConfig {
            num_decode_workers: 0,
            ..Default::default()
        };
        assert!(cfg.effective_decode_workers() >= 1);
    }
}
