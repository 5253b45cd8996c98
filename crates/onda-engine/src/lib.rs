//! onda-engine: Real-time audio source mixing
//!
//! Blends many simultaneous sources into submix buffers on a single render
//! thread:
//! - Fixed pool of source slots addressed by `SourceId`
//! - Double-buffered command queue (game thread to render thread)
//! - Chunked asynchronous decode with a small per-source buffer ring
//! - Per-frame linear parameter ramps, one-pole filters, channel-mapped
//!   panning and HRTF hand-off
//! - Submix and audio-bus accumulation
//!
//! `SourceManager::new` returns the render-side manager and the game-side
//! `SourceManagerHandle`; `MixerSource` sits on top of the handle and is the
//! surface game code drives once per tick.

// Audio engine uses explicit indexing in interleaved frame loops
#![allow(clippy::needless_range_loop)]
// Too many arguments is common in audio processing functions
#![allow(clippy::too_many_arguments)]

mod channel_map;
mod command;
mod config;
mod decode;
mod effect;
mod source;
mod source_buffer;
mod source_manager;
mod source_voice;
mod spatializer;
mod submix;
mod wave;

pub use channel_map::*;
pub use command::*;
pub use config::*;
pub use decode::*;
pub use effect::*;
pub use source::*;
pub use source_buffer::*;
pub use source_manager::*;
pub use source_voice::*;
pub use spatializer::*;
pub use submix::*;
pub use wave::*;

use thiserror::Error;

/// Validation and lifecycle errors surfaced to game code.
///
/// Pool exhaustion is deliberately not here: a full pool is a normal runtime
/// condition reported as `None` from `get_free_source_id`.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid source format: {0}")]
    InvalidFormat(String),

    #[error("Procedural source is already generating")]
    AlreadyGenerating,

    #[error("Source slot {0} is already in use")]
    SlotBusy(onda_core::SourceId),

    #[error("Source needs exactly one input (buffer or bus)")]
    MissingInput,

    #[error("Source id {0} is not valid")]
    InvalidSourceId(onda_core::SourceId),

    #[error("Source is not ready for this operation")]
    NotReady,
}
