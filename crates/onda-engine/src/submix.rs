//! Submix and audio-bus accumulation targets.
//!
//! Both are plain interleaved block buffers the render thread clears at the
//! top of each block and sums sources into. Submixes carry a channel layout
//! and are what the device (or an outer mix graph) consumes; buses carry a
//! bare channel count and feed bus-input sources within the same block.

use onda_core::{BusId, ChannelLayout, Sample, SubmixId};
use onda_dsp::Ramp;

/// Default device-facing submix, registered at engine construction.
pub const DEVICE_SUBMIX: SubmixId = SubmixId(0);

pub(crate) struct Submix {
    pub id: SubmixId,
    pub layout: ChannelLayout,
    pub buffer: Vec<Sample>,
}

impl Submix {
    pub(crate) fn new(id: SubmixId, layout: ChannelLayout, block_frames: usize) -> Self {
        Self {
            id,
            layout,
            buffer: vec![0.0; block_frames * layout.num_channels()],
        }
    }

    #[inline]
    pub(crate) fn num_channels(&self) -> usize {
        self.layout.num_channels()
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

pub(crate) struct BusInstance {
    pub id: BusId,
    pub num_channels: usize,
    pub buffer: Vec<Sample>,
}

impl BusInstance {
    pub(crate) fn new(id: BusId, num_channels: usize, block_frames: usize) -> Self {
        Self {
            id,
            num_channels,
            buffer: vec![0.0; block_frames * num_channels],
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

/// Accumulate `src` into `dst` with a per-frame ramped level, folding
/// channel-count mismatches: mono fans out to every destination channel,
/// everything else wraps by index.
pub(crate) fn mix_fold(
    src: &[Sample],
    num_src: usize,
    dst: &mut [Sample],
    num_dst: usize,
    level: &mut Ramp,
) {
    let frames = dst.len() / num_dst;
    debug_assert!(src.len() >= frames * num_src);

    if num_src == num_dst {
        for frame in 0..frames {
            let g = level.next();
            let s = frame * num_src;
            let d = frame * num_dst;
            for ch in 0..num_dst {
                dst[d + ch] += src[s + ch] * g;
            }
        }
    } else if num_src == 1 {
        for frame in 0..frames {
            let g = level.next();
            let sample = src[frame] * g;
            let d = frame * num_dst;
            for ch in 0..num_dst {
                dst[d + ch] += sample;
            }
        }
    } else {
        for frame in 0..frames {
            let g = level.next();
            let s = frame * num_src;
            let d = frame * num_dst;
            for ch in 0..num_src {
                dst[d + ch % num_dst] += src[s + ch] * g;
            }
        }
    }
}
