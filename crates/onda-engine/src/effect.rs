//! Per-source insert effects.

use onda_core::Sample;

/// Insert effect on a source's pre-attenuation signal path.
///
/// Effects run on the render thread inside source generation and must not
/// block or allocate. After the source's input ends, a chain initialized
/// with `play_effect_tails` keeps processing silence until every effect
/// reports its tail rung out; only then does the source count as finished.
pub trait SourceEffect: Send {
    /// Process one interleaved block in place.
    fn process(&mut self, buffer: &mut [Sample], num_channels: usize);

    /// Decay state fully rung out after input went silent.
    fn tails_done(&self) -> bool {
        true
    }
}
