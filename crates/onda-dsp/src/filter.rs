//! One-pole low/high-pass filters for per-source tone shaping.
//!
//! Cutoff changes arrive ramped from the command queue, so set_cutoff is
//! called once per frame while a ramp is active. The coefficient recompute
//! early-outs on an unchanged value.

use onda_core::{MAX_CHANNELS, Sample};

/// Lowest settable cutoff in Hz.
pub const MIN_FILTER_FREQUENCY: Sample = 20.0;
/// Highest settable cutoff in Hz; a lowpass at or above it is bypassed.
pub const MAX_FILTER_FREQUENCY: Sample = 20_000.0;

#[inline]
fn one_pole_coeff(cutoff: Sample, sample_rate: Sample) -> Sample {
    1.0 - (-std::f32::consts::TAU * cutoff / sample_rate).exp()
}

/// One-pole lowpass across up to [`MAX_CHANNELS`] channels.
#[derive(Debug, Clone)]
pub struct OnePoleLpf {
    state: [Sample; MAX_CHANNELS],
    num_channels: usize,
    sample_rate: Sample,
    cutoff: Sample,
    coeff: Sample,
}

impl OnePoleLpf {
    pub fn new(sample_rate: Sample, num_channels: usize) -> Self {
        let mut lpf = Self {
            state: [0.0; MAX_CHANNELS],
            num_channels: num_channels.min(MAX_CHANNELS),
            sample_rate,
            cutoff: 0.0,
            coeff: 1.0,
        };
        lpf.set_cutoff(MAX_FILTER_FREQUENCY);
        lpf
    }

    /// Set cutoff in Hz. No-op when unchanged.
    #[inline]
    pub fn set_cutoff(&mut self, cutoff: Sample) {
        let cutoff = cutoff.clamp(MIN_FILTER_FREQUENCY, MAX_FILTER_FREQUENCY);
        if cutoff == self.cutoff {
            return;
        }
        self.cutoff = cutoff;
        self.coeff = one_pole_coeff(cutoff, self.sample_rate);
    }

    #[inline]
    pub fn cutoff(&self) -> Sample {
        self.cutoff
    }

    /// Fully open, caller may skip processing.
    #[inline]
    pub fn is_bypassed(&self) -> bool {
        self.cutoff >= MAX_FILTER_FREQUENCY
    }

    /// Filter one interleaved frame in place.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [Sample]) {
        for (ch, sample) in frame.iter_mut().enumerate().take(self.num_channels) {
            let y = self.state[ch] + self.coeff * (*sample - self.state[ch]);
            self.state[ch] = y;
            *sample = y;
        }
    }

    pub fn reset(&mut self) {
        self.state = [0.0; MAX_CHANNELS];
    }
}

/// One-pole highpass (input minus internal lowpass) across up to
/// [`MAX_CHANNELS`] channels. Cutoff at or below [`MIN_FILTER_FREQUENCY`]
/// bypasses the filter.
#[derive(Debug, Clone)]
pub struct OnePoleHpf {
    state: [Sample; MAX_CHANNELS],
    num_channels: usize,
    sample_rate: Sample,
    cutoff: Sample,
    coeff: Sample,
}

impl OnePoleHpf {
    pub fn new(sample_rate: Sample, num_channels: usize) -> Self {
        let mut hpf = Self {
            state: [0.0; MAX_CHANNELS],
            num_channels: num_channels.min(MAX_CHANNELS),
            sample_rate,
            cutoff: Sample::NAN,
            coeff: 0.0,
        };
        hpf.set_cutoff(0.0);
        hpf
    }

    /// Set cutoff in Hz. No-op when unchanged.
    #[inline]
    pub fn set_cutoff(&mut self, cutoff: Sample) {
        let cutoff = cutoff.clamp(0.0, MAX_FILTER_FREQUENCY);
        if cutoff == self.cutoff {
            return;
        }
        self.cutoff = cutoff;
        self.coeff = one_pole_coeff(cutoff.max(MIN_FILTER_FREQUENCY), self.sample_rate);
    }

    #[inline]
    pub fn cutoff(&self) -> Sample {
        self.cutoff
    }

    /// Fully open, caller may skip processing.
    #[inline]
    pub fn is_bypassed(&self) -> bool {
        self.cutoff <= MIN_FILTER_FREQUENCY
    }

    /// Filter one interleaved frame in place.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [Sample]) {
        for (ch, sample) in frame.iter_mut().enumerate().take(self.num_channels) {
            let lp = self.state[ch] + self.coeff * (*sample - self.state[ch]);
            self.state[ch] = lp;
            *sample -= lp;
        }
    }

    pub fn reset(&mut self) {
        self.state = [0.0; MAX_CHANNELS];
    }
}
