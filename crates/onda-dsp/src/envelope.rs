//! Per-source envelope following.

use onda_core::Sample;

/// Attack/release envelope follower.
///
/// Runs on the mono sum of a source's post-attenuation output; the value is
/// published once per block so game code can drive ducking or visuals.
#[derive(Debug, Clone)]
pub struct EnvelopeFollower {
    attack_coeff: Sample,
    release_coeff: Sample,
    value: Sample,
}

impl EnvelopeFollower {
    pub fn new(sample_rate: Sample, attack_ms: Sample, release_ms: Sample) -> Self {
        Self {
            attack_coeff: Self::coeff(attack_ms, sample_rate),
            release_coeff: Self::coeff(release_ms, sample_rate),
            value: 0.0,
        }
    }

    fn coeff(time_ms: Sample, sample_rate: Sample) -> Sample {
        if time_ms <= 0.0 {
            0.0
        } else {
            (-1.0 / (time_ms * 0.001 * sample_rate)).exp()
        }
    }

    pub fn set_times(&mut self, sample_rate: Sample, attack_ms: Sample, release_ms: Sample) {
        self.attack_coeff = Self::coeff(attack_ms, sample_rate);
        self.release_coeff = Self::coeff(release_ms, sample_rate);
    }

    #[inline]
    pub fn process(&mut self, sample: Sample) {
        let abs = sample.abs();
        let coeff = if abs > self.value {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.value = abs + coeff * (self.value - abs);
    }

    /// Follow the mono sum of an interleaved buffer.
    pub fn process_interleaved(&mut self, buffer: &[Sample], num_channels: usize) {
        if num_channels == 0 {
            return;
        }
        let scale = 1.0 / num_channels as Sample;
        for frame in buffer.chunks_exact(num_channels) {
            let sum: Sample = frame.iter().sum();
            self.process(sum * scale);
        }
    }

    #[inline]
    pub fn value(&self) -> Sample {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}
