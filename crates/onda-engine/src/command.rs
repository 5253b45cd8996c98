//! Game-to-render command plumbing.
//!
//! Commands accumulate in a double-buffered queue: game-side calls push
//! into the write buffer while the render thread drains the other one. At
//! the top of each block the render thread flips the buffers and processes
//! everything the game submitted since the previous flip, in submission
//! order. Nothing is applied mid-block.

use std::sync::atomic::{AtomicUsize, Ordering};

use onda_core::{BusId, ChannelLayout, SourceId, SubmixId};
use parking_lot::Mutex;

use crate::{ChannelMapParam, SourceInitArgs, SpatializationParams};

/// Source init payload, boxed to keep the command enum small.
pub(crate) struct InitCommand {
    pub args: SourceInitArgs,
    /// Object spatialization resolved against engine capabilities.
    pub hrtf: bool,
    /// Channel count resolved from the buffer format or the input bus.
    pub num_channels: usize,
}

pub(crate) enum SourceCommand {
    Init {
        id: SourceId,
        init: Box<InitCommand>,
    },
    Play {
        id: SourceId,
    },
    Pause {
        id: SourceId,
    },
    Stop {
        id: SourceId,
    },
    StopFade {
        id: SourceId,
        fade_frames: u32,
    },
    Release {
        id: SourceId,
    },
    SetVolume {
        id: SourceId,
        volume: f32,
    },
    SetDistanceAttenuation {
        id: SourceId,
        gain: f32,
    },
    SetPitch {
        id: SourceId,
        pitch: f32,
    },
    SetLpfFrequency {
        id: SourceId,
        frequency: f32,
    },
    SetHpfFrequency {
        id: SourceId,
        frequency: f32,
    },
    SetChannelMap {
        id: SourceId,
        map: ChannelMapParam,
    },
    SetSubmixSend {
        id: SourceId,
        submix: SubmixId,
        level: f32,
    },
    SetBusSend {
        id: SourceId,
        bus: BusId,
        level: f32,
    },
    SetSpatializationParams {
        id: SourceId,
        params: SpatializationParams,
    },
    RegisterSubmix {
        submix: SubmixId,
        layout: ChannelLayout,
    },
    RegisterBus {
        bus: BusId,
        num_channels: usize,
    },
}

/// Double-buffered command queue.
///
/// `write_index` names the buffer writers currently push into. The render
/// thread flips the index and drains the buffer it just retired; a writer
/// that raced the flip re-checks the index under the buffer lock and moves
/// to the fresh buffer, so a drained buffer never receives a straggler.
pub(crate) struct CommandQueue {
    buffers: [Mutex<Vec<SourceCommand>>; 2],
    write_index: AtomicUsize,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self {
            buffers: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            write_index: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, command: SourceCommand) {
        loop {
            let index = self.write_index.load(Ordering::Acquire);
            let mut buffer = self.buffers[index].lock();
            if self.write_index.load(Ordering::Acquire) == index {
                buffer.push(command);
                return;
            }
        }
    }

    /// Flip the buffers and move every pending command into `out`,
    /// preserving submission order. Returns the number drained.
    pub(crate) fn drain(&self, out: &mut Vec<SourceCommand>) -> usize {
        let read_index = self.write_index.fetch_xor(1, Ordering::AcqRel);
        let mut buffer = self.buffers[read_index].lock();
        let count = buffer.len();
        out.append(&mut buffer);
        count
    }
}
