//! Source-to-destination channel gain maps.
//!
//! A map holds one gain per (source channel, destination channel) pair and
//! crossfades toward newly submitted gains over one render block. Storage
//! uses a fixed `MAX_CHANNELS` stride so resubmitting a map never
//! reallocates on the render thread.

use onda_core::{ChannelLayout, MAX_CHANNELS, Sample};
use onda_dsp::compute_panning_gains;
use smallvec::SmallVec;

const MAP_LEN: usize = MAX_CHANNELS * MAX_CHANNELS;

/// A freshly computed map headed for the render thread, packed source-major:
/// `gains[src * num_dst + dst]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMapParam {
    pub layout: ChannelLayout,
    pub gains: SmallVec<[Sample; 16]>,
}

/// Gain matrix mixing a source's channels into a destination layout.
#[derive(Debug, Clone)]
pub struct ChannelGainMap {
    start: [Sample; MAP_LEN],
    target: [Sample; MAP_LEN],
    num_src: usize,
    num_dst: usize,
}

impl ChannelGainMap {
    pub fn new(num_src: usize, num_dst: usize) -> Self {
        debug_assert!(num_src >= 1 && num_src <= MAX_CHANNELS);
        debug_assert!(num_dst >= 1 && num_dst <= MAX_CHANNELS);
        Self {
            start: [0.0; MAP_LEN],
            target: [0.0; MAP_LEN],
            num_src,
            num_dst,
        }
    }

    /// Mapping used when a source never submits explicit gains.
    ///
    /// Mono pans center through the layout's speaker ring. Stereo keeps its
    /// image (identity, fold to mono, or front pair of a surround bed; into
    /// ambisonics only W is fed). Matching counts pass through unchanged.
    /// Remaining surround-to-narrow cases fold by speaker role with the LFE
    /// dropped; anything more exotic wraps by channel index and callers are
    /// expected to submit a real map.
    pub fn default_for(num_src: usize, layout: ChannelLayout) -> Self {
        let num_dst = layout.num_channels();
        let mut map = Self::new(num_src, num_dst);

        match (num_src, layout) {
            (1, _) => {
                let mut gains = [0.0; MAX_CHANNELS];
                compute_panning_gains(0.0, layout, &mut gains[..num_dst]);
                for dst in 0..num_dst {
                    map.target[dst] = gains[dst];
                }
            }
            (2, ChannelLayout::Mono) => {
                map.target[0] = std::f32::consts::FRAC_1_SQRT_2;
                map.target[MAX_CHANNELS] = std::f32::consts::FRAC_1_SQRT_2;
            }
            (2, ChannelLayout::AmbisonicsFirstOrder) => {
                map.target[0] = std::f32::consts::FRAC_1_SQRT_2;
                map.target[MAX_CHANNELS] = std::f32::consts::FRAC_1_SQRT_2;
            }
            (2, _) => {
                // Front left/right of every wider bed.
                map.target[0] = 1.0;
                map.target[MAX_CHANNELS + 1] = 1.0;
            }
            (n, _) if n == num_dst => {
                for ch in 0..n {
                    map.target[ch * MAX_CHANNELS + ch] = 1.0;
                }
            }
            (n, ChannelLayout::Mono | ChannelLayout::Stereo) if n >= 6 => {
                // Standard interleave order: FL FR C LFE then rear/side pairs.
                for src in 0..n {
                    if src == 3 {
                        continue;
                    }
                    if src == 2 {
                        let g = if num_dst == 1 {
                            std::f32::consts::FRAC_1_SQRT_2
                        } else {
                            0.5
                        };
                        for dst in 0..num_dst {
                            map.target[src * MAX_CHANNELS + dst] = g;
                        }
                        continue;
                    }
                    let dst = if num_dst == 1 { 0 } else { src % 2 };
                    let g = if src < 2 {
                        1.0
                    } else {
                        std::f32::consts::FRAC_1_SQRT_2
                    };
                    map.target[src * MAX_CHANNELS + dst] = g;
                }
            }
            (n, _) => {
                for src in 0..n {
                    map.target[src * MAX_CHANNELS + (src % num_dst)] = 1.0;
                }
            }
        }

        map.start = map.target;
        map
    }

    #[inline]
    pub fn num_src_channels(&self) -> usize {
        self.num_src
    }

    #[inline]
    pub fn num_dst_channels(&self) -> usize {
        self.num_dst
    }

    /// Expected packed gain count for a submitted map.
    #[inline]
    pub fn packed_len(&self) -> usize {
        self.num_src * self.num_dst
    }

    /// Install `gains` with no crossfade. Used at source init.
    pub fn snap(&mut self, gains: &[Sample]) {
        debug_assert_eq!(gains.len(), self.packed_len());
        self.unpack_into_target(gains);
        self.start = self.target;
    }

    /// Install `gains` as the new target; playback crossfades from the
    /// currently settled gains over the next block.
    pub fn set_target(&mut self, gains: &[Sample]) {
        debug_assert_eq!(gains.len(), self.packed_len());
        self.start = self.target;
        self.unpack_into_target(gains);
    }

    fn unpack_into_target(&mut self, gains: &[Sample]) {
        for src in 0..self.num_src {
            for dst in 0..self.num_dst {
                self.target[src * MAX_CHANNELS + dst] = gains[src * self.num_dst + dst];
            }
        }
    }

    /// Gain for one channel pair at `alpha` (0 at block start, 1 at end).
    #[inline]
    pub fn gain(&self, src: usize, dst: usize, alpha: Sample) -> Sample {
        let i = src * MAX_CHANNELS + dst;
        self.start[i] + (self.target[i] - self.start[i]) * alpha
    }

    #[inline]
    pub fn target_gain(&self, src: usize, dst: usize) -> Sample {
        self.target[src * MAX_CHANNELS + dst]
    }

    /// Settle the crossfade after a rendered block.
    pub fn finish_block(&mut self) {
        self.start = self.target;
    }

    pub fn is_crossfading(&self) -> bool {
        self.start != self.target
    }
}
