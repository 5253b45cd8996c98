//! Linear parameter interpolation for per-frame render values.
//!
//! Parameter changes arrive once per render block from the command queue;
//! a ramp spreads each change across a frame count so gains, pitch and
//! filter cutoffs never step audibly.

use onda_core::Sample;

/// Linearly interpolated render parameter.
///
/// The ramp lands exactly on its target: after `num_frames` calls to
/// [`next`](Self::next) the value *is* the target, not an epsilon away,
/// and intermediate values stay between start and target.
#[derive(Debug, Clone, Copy)]
pub struct Ramp {
    start: Sample,
    target: Sample,
    current: Sample,
    frames_total: u32,
    frame: u32,
}

impl Ramp {
    pub fn new(value: Sample) -> Self {
        Self {
            start: value,
            target: value,
            current: value,
            frames_total: 0,
            frame: 0,
        }
    }

    /// Restart the ramp from the current value towards `target` over
    /// `num_frames` frames. Zero frames snaps immediately.
    pub fn set_target(&mut self, target: Sample, num_frames: u32) {
        if num_frames == 0 {
            self.set_value(target);
            return;
        }
        self.start = self.current;
        self.target = target;
        self.frames_total = num_frames;
        self.frame = 0;
    }

    /// Snap to `value` with no interpolation.
    pub fn set_value(&mut self, value: Sample) {
        self.start = value;
        self.target = value;
        self.current = value;
        self.frames_total = 0;
        self.frame = 0;
    }

    /// Advance one frame and return the new value.
    #[inline]
    pub fn next(&mut self) -> Sample {
        if self.frame < self.frames_total {
            self.frame += 1;
            if self.frame >= self.frames_total {
                self.current = self.target;
            } else {
                let alpha = self.frame as Sample / self.frames_total as Sample;
                self.current = self.start + (self.target - self.start) * alpha;
            }
        }
        self.current
    }

    #[inline]
    pub fn value(&self) -> Sample {
        self.current
    }

    #[inline]
    pub fn target(&self) -> Sample {
        self.target
    }

    #[inline]
    pub fn is_ramping(&self) -> bool {
        self.frame < self.frames_total
    }

    /// Jump to the ramp end, discarding remaining frames.
    pub fn snap_to_target(&mut self) {
        self.current = self.target;
        self.frame = self.frames_total;
    }
}
