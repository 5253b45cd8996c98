//! Object-based (HRTF) spatialization interface.

use onda_core::{Sample, SourceId};

/// Emitter geometry forwarded to the spatializer once per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatializationParams {
    /// Listener-relative emitter position.
    pub emitter_position: [f32; 3],
    pub distance: f32,
    pub azimuth_degrees: f32,
    pub elevation_degrees: f32,
}

impl Default for SpatializationParams {
    fn default() -> Self {
        Self {
            emitter_position: [0.0; 3],
            distance: 1.0,
            azimuth_degrees: 0.0,
            elevation_degrees: 0.0,
        }
    }
}

/// Binaural / object renderer plugged in at engine construction.
///
/// Only mono sources are eligible. The render thread hands the spatializer a
/// source's mono block and takes back interleaved stereo; implementations
/// must not block or allocate there.
pub trait Spatializer: Send {
    /// Latest emitter geometry for a source.
    fn set_params(&mut self, source: SourceId, params: &SpatializationParams);

    /// Render `input` (mono frames) into `output` (interleaved stereo,
    /// `2 * input.len()` samples).
    fn process(&mut self, source: SourceId, input: &[Sample], output: &mut [Sample]);

    /// A slot rendered through this spatializer was torn down.
    fn on_release(&mut self, _source: SourceId) {}
}
