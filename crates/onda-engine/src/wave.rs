//! Wave assets and per-tick playback parameters.
//!
//! The asset pipeline and codecs live outside the engine; what arrives here
//! is either resident PCM, a codec adapter implementing
//! [`StreamingDecoder`], or a game-side generator behind a
//! [`ProceduralHandle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use onda_core::{BusId, MAX_CHANNELS, Sample, SubmixId};
use onda_dsp::MAX_FILTER_FREQUENCY;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::SourceError;

/// Looping behavior fixed at source init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopingMode {
    #[default]
    None,
    /// Wrap seamlessly; every wrap is reported so callers can fire
    /// notification callbacks.
    Loop,
}

/// Stream format of a wave asset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveFormat {
    pub num_channels: usize,
    pub sample_rate: u32,
    /// Total frames; `None` when open-ended (procedural).
    pub num_frames: Option<u64>,
}

/// Fully resident interleaved PCM.
#[derive(Debug)]
pub struct PcmData {
    samples: Vec<Sample>,
    num_channels: usize,
    sample_rate: u32,
}

impl PcmData {
    pub fn new(
        samples: Vec<Sample>,
        num_channels: usize,
        sample_rate: u32,
    ) -> Result<Self, SourceError> {
        if num_channels == 0 || num_channels > MAX_CHANNELS {
            return Err(SourceError::InvalidFormat(format!(
                "unsupported channel count {num_channels}"
            )));
        }
        if sample_rate == 0 {
            return Err(SourceError::InvalidFormat("zero sample rate".into()));
        }
        if samples.len() % num_channels != 0 {
            return Err(SourceError::InvalidFormat(
                "sample data not frame aligned".into(),
            ));
        }
        Ok(Self {
            samples,
            num_channels,
            sample_rate,
        })
    }

    #[inline]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    #[inline]
    pub fn num_frames(&self) -> u64 {
        (self.samples.len() / self.num_channels) as u64
    }

    pub fn format(&self) -> WaveFormat {
        WaveFormat {
            num_channels: self.num_channels,
            sample_rate: self.sample_rate,
            num_frames: Some(self.num_frames()),
        }
    }
}

/// Outcome of one chunk decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeProgress {
    pub frames_written: usize,
    /// The read position wrapped past the asset end this chunk.
    pub looped: bool,
    /// No further audio will be produced.
    pub finished: bool,
}

/// External codec adapter.
///
/// Implementations own their compressed payload and decode state; the engine
/// drives them exclusively from decode worker threads, one chunk at a time.
pub trait StreamingDecoder: Send {
    fn format(&self) -> WaveFormat;

    /// Decode up to `out.len() / channels` frames into `out`. A `Loop` mode
    /// wraps internally and flags the wrap instead of finishing.
    fn decode(&mut self, out: &mut [Sample], looping: LoopingMode) -> DecodeProgress;

    /// Position the next decode at an absolute frame.
    fn seek_to_frame(&mut self, frame: u64);
}

/// Game-side audio generator (synthesis, capture, network voice).
pub trait ProceduralSource: Send {
    /// Fill up to `out.len() / channels` frames; return frames written.
    /// Writing fewer frames than asked is an underrun, not the end.
    fn generate(&mut self, out: &mut [Sample]) -> usize;

    /// Report end-of-stream; a finished generator lets the source complete.
    fn is_finished(&self) -> bool {
        false
    }
}

struct ProceduralShared {
    generating: AtomicBool,
    format: WaveFormat,
    generator: Mutex<Box<dyn ProceduralSource>>,
}

/// Shared ownership of a procedural generator with an exclusive-use claim.
///
/// A generator feeds at most one source at a time; initializing a second
/// sound over a handle that is still generating fails at buffer creation.
#[derive(Clone)]
pub struct ProceduralHandle {
    inner: Arc<ProceduralShared>,
}

impl ProceduralHandle {
    pub fn new(num_channels: usize, sample_rate: u32, generator: Box<dyn ProceduralSource>) -> Self {
        Self {
            inner: Arc::new(ProceduralShared {
                generating: AtomicBool::new(false),
                format: WaveFormat {
                    num_channels,
                    sample_rate,
                    num_frames: None,
                },
                generator: Mutex::new(generator),
            }),
        }
    }

    #[inline]
    pub fn format(&self) -> WaveFormat {
        self.inner.format
    }

    #[inline]
    pub fn is_generating(&self) -> bool {
        self.inner.generating.load(Ordering::Acquire)
    }

    pub(crate) fn try_claim(&self) -> bool {
        !self.inner.generating.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_claim(&self) {
        self.inner.generating.store(false, Ordering::Release);
    }

    /// Run the generator for one chunk. Returns frames written and whether
    /// the generator reported completion.
    pub(crate) fn generate(&self, out: &mut [Sample]) -> (usize, bool) {
        let mut generator = self.inner.generator.lock();
        let written = generator.generate(out);
        (written, generator.is_finished())
    }
}

/// Audio input of a source slot.
pub enum WaveSource {
    /// Fully resident interleaved PCM.
    RawPcm { data: Arc<PcmData> },
    /// Compressed stream decoded chunk by chunk through an external codec.
    /// `cached_first_chunk` is pre-decoded audio the asset system keeps
    /// resident so playback starts without waiting on the first task.
    Streaming {
        decoder: Box<dyn StreamingDecoder>,
        cached_first_chunk: Option<Arc<[Sample]>>,
    },
    /// Game-generated audio pulled through the decode pool.
    Procedural { handle: ProceduralHandle },
}

impl WaveSource {
    pub fn format(&self) -> WaveFormat {
        match self {
            Self::RawPcm { data } => data.format(),
            Self::Streaming { decoder, .. } => decoder.format(),
            Self::Procedural { handle } => handle.format(),
        }
    }

    pub fn is_procedural(&self) -> bool {
        matches!(self, Self::Procedural { .. })
    }
}

/// Per-send level into a submix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmixSendParam {
    pub submix: SubmixId,
    pub level: f32,
}

/// Per-send level into an audio bus (pre-attenuation tap).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusSendParam {
    pub bus: BusId,
    pub level: f32,
}

/// Per-tick playback parameters handed to `MixerSource::update`.
///
/// Game code recomputes these from attenuation settings and listener
/// geometry each tick; the mixer source diffs them against its cached state
/// and forwards only actual changes.
#[derive(Debug, Clone)]
pub struct WaveInstance {
    pub volume: f32,
    /// Distance/occlusion gain, kept separate from `volume` so bus taps stay
    /// pre-attenuation.
    pub distance_attenuation: f32,
    pub pitch: f32,
    pub lpf_frequency: f32,
    pub hpf_frequency: f32,
    /// Pan by listener geometry at all (false = straight channel map).
    pub spatialized: bool,
    /// Prefer object-based (HRTF) rendering when the engine allows it.
    pub use_object_spatialization: bool,
    /// Degrees clockwise from front center.
    pub azimuth_degrees: f32,
    pub elevation_degrees: f32,
    pub listener_distance: f32,
    /// World-space stereo image width.
    pub stereo_spread: f32,
    pub emitter_position: [f32; 3],
    pub submix_sends: SmallVec<[SubmixSendParam; 2]>,
    pub bus_sends: SmallVec<[BusSendParam; 2]>,
}

impl Default for WaveInstance {
    fn default() -> Self {
        Self {
            volume: 1.0,
            distance_attenuation: 1.0,
            pitch: 1.0,
            lpf_frequency: MAX_FILTER_FREQUENCY,
            hpf_frequency: 0.0,
            spatialized: false,
            use_object_spatialization: false,
            azimuth_degrees: 0.0,
            elevation_degrees: 0.0,
            listener_distance: 1.0,
            stereo_spread: 0.0,
            emitter_position: [0.0; 3],
            submix_sends: SmallVec::new(),
            bus_sends: SmallVec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_validation() {
        assert!(PcmData::new(vec![0.0; 64], 2, 48000).is_ok());
        assert!(PcmData::new(vec![0.0; 64], 0, 48000).is_err());
        assert!(PcmData::new(vec![0.0; 64], 9, 48000).is_err());
        assert!(PcmData::new(vec![0.0; 63], 2, 48000).is_err());
        assert!(PcmData::new(vec![0.0; 64], 2, 0).is_err());
    }

    #[test]
    fn test_procedural_claim_is_exclusive() {
        struct Silent;
        impl ProceduralSource for Silent {
            fn generate(&mut self, out: &mut [Sample]) -> usize {
                out.fill(0.0);
                out.len()
            }
        }

        let handle = ProceduralHandle::new(1, 48000, Box::new(Silent));
        assert!(handle.try_claim());
        assert!(handle.is_generating());
        assert!(!handle.try_claim());
        handle.release_claim();
        assert!(handle.try_claim());
    }
}
