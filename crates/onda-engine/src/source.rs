//! Game-side per-sound controller.
//!
//! `MixerSource` drives one sound through its whole life: `prepare` builds
//! the source buffer so decode warm-up overlaps the rest of the game tick,
//! `init` claims a slot once audio is ready, and `update` diffs the fresh
//! [`WaveInstance`] against cached state each tick, forwarding only actual
//! changes through the voice.
//!
//! Spatialization policy lives here, not in the render loop: panning maps
//! are computed game-side from azimuth and layout and submitted as channel
//! maps, so the render thread only ever crossfades between gain sets.

use onda_core::{ChannelLayout, Sample};
use onda_dsp::{compute_panning_gains, stereo_spread_azimuths};
use smallvec::SmallVec;

use crate::{
    ChannelMapParam, DEVICE_SUBMIX, LoopingMode, SourceBuffer, SourceEffect, SourceError,
    SourceInitArgs, SourceManagerHandle, SourceVoice, SpatializationParams, SubmixSendParam,
    WaveInstance, WaveSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    NotInitialized,
    Preparing,
    Initialized,
    Released,
}

fn spat_params_of(instance: &WaveInstance) -> SpatializationParams {
    SpatializationParams {
        emitter_position: instance.emitter_position,
        distance: instance.listener_distance,
        azimuth_degrees: instance.azimuth_degrees,
        elevation_degrees: instance.elevation_degrees,
    }
}

/// One sound's connection to the source pool.
///
/// A mixer source is single-use: released (or dropped) sources stay
/// released; the next sound gets a fresh one.
pub struct MixerSource {
    handle: SourceManagerHandle,
    state: SourceState,
    buffer: Option<SourceBuffer>,
    effects: Vec<Box<dyn SourceEffect>>,
    play_effect_tails: bool,
    wave_sample_rate: u32,
    total_frames: Option<u64>,
    num_channels: usize,
    voice: Option<SourceVoice>,
    spatialized: bool,
    hrtf_active: bool,
    /// Layouts of every submix this source sends to, for map recompute.
    send_layouts: SmallVec<[ChannelLayout; 2]>,
    /// Azimuths the current channel maps were computed for (left, right;
    /// mono uses both equal).
    last_azimuths: (f32, f32),
    last_spat: SpatializationParams,
    last_loop_count: u32,
    on_loop: Option<Box<dyn FnMut() + Send>>,
}

impl MixerSource {
    pub fn new(handle: SourceManagerHandle) -> Self {
        Self {
            handle,
            state: SourceState::NotInitialized,
            buffer: None,
            effects: Vec::new(),
            play_effect_tails: false,
            wave_sample_rate: 0,
            total_frames: None,
            num_channels: 0,
            voice: None,
            spatialized: false,
            hrtf_active: false,
            send_layouts: SmallVec::new(),
            last_azimuths: (0.0, 0.0),
            last_spat: SpatializationParams::default(),
            last_loop_count: 0,
            on_loop: None,
        }
    }

    /// Start buffering the wave. Decode tasks begin immediately; call
    /// [`is_prepared_to_init`](Self::is_prepared_to_init) until audio is
    /// ready, then [`init`](Self::init).
    pub fn prepare(
        &mut self,
        source: WaveSource,
        looping: LoopingMode,
        effects: Vec<Box<dyn SourceEffect>>,
        play_effect_tails: bool,
    ) -> Result<(), SourceError> {
        if self.state != SourceState::NotInitialized {
            return Err(SourceError::NotReady);
        }
        let format = source.format();
        let buffer = SourceBuffer::new(
            source,
            looping,
            self.handle.config().chunk_frames,
            self.handle.decode_scheduler(),
        )?;
        self.wave_sample_rate = format.sample_rate;
        self.total_frames = format.num_frames;
        self.num_channels = format.num_channels;
        self.buffer = Some(buffer);
        self.effects = effects;
        self.play_effect_tails = play_effect_tails;
        self.state = SourceState::Preparing;
        Ok(())
    }

    /// Poll decode progress; true once the first audio is ready (or the
    /// asset turned out to be empty).
    pub fn is_prepared_to_init(&mut self) -> bool {
        if self.state != SourceState::Preparing {
            return false;
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return false;
        };
        buffer.update();
        buffer.has_audio_ready() || buffer.is_finished_decoding()
    }

    /// Claim a slot and initialize the source from `instance`.
    ///
    /// `Ok(false)` means the pool is exhausted; the prepared buffer is kept
    /// so the caller can retry next tick. Wave sample rate is folded into
    /// pitch here, and an instance with no sends at all gets a unity send
    /// to the device submix.
    pub fn init(&mut self, instance: &WaveInstance) -> Result<bool, SourceError> {
        if self.state != SourceState::Preparing {
            return Err(SourceError::NotReady);
        }
        let Some(id) = self.handle.get_free_source_id() else {
            return Ok(false);
        };

        let pitch = instance.pitch * self.rate_ratio();

        let mut submix_sends = instance.submix_sends.clone();
        if submix_sends.is_empty() && instance.bus_sends.is_empty() {
            submix_sends.push(SubmixSendParam {
                submix: DEVICE_SUBMIX,
                level: 1.0,
            });
        }

        self.send_layouts = SmallVec::new();
        for send in &submix_sends {
            if let Some(layout) = self.handle.submix_layout(send.submix) {
                if !self.send_layouts.contains(&layout) {
                    self.send_layouts.push(layout);
                }
            }
        }

        self.spatialized = instance.spatialized;
        self.hrtf_active = instance.use_object_spatialization
            && self.handle.object_spatialization_available()
            && self.num_channels == 1;

        let mut channel_maps: SmallVec<[ChannelMapParam; 2]> = SmallVec::new();
        if self.spatialized && !self.hrtf_active {
            self.last_azimuths = Self::current_azimuths(self.num_channels, instance);
            for &layout in &self.send_layouts {
                if let Some(map) = Self::panned_map(self.num_channels, self.last_azimuths, layout)
                {
                    channel_maps.push(map);
                }
            }
        }
        self.last_spat = spat_params_of(instance);

        let args = SourceInitArgs {
            buffer: self.buffer.take(),
            bus_input: None,
            volume: instance.volume,
            distance_attenuation: instance.distance_attenuation,
            pitch,
            lpf_frequency: instance.lpf_frequency,
            hpf_frequency: instance.hpf_frequency,
            submix_sends,
            bus_sends: instance.bus_sends.clone(),
            channel_maps,
            use_object_spatialization: instance.use_object_spatialization,
            spatialization: self.last_spat,
            effects: std::mem::take(&mut self.effects),
            play_effect_tails: self.play_effect_tails,
        };
        let voice = SourceVoice::new(self.handle.clone(), id, &args);

        match self.handle.init_source(id, args) {
            Ok(()) => {
                self.voice = Some(voice);
                self.last_loop_count = 0;
                self.state = SourceState::Initialized;
                Ok(true)
            }
            Err(e) => {
                // The id is already back in the pool and the buffer is
                // gone; this sound cannot be retried.
                self.state = SourceState::NotInitialized;
                Err(e)
            }
        }
    }

    /// Per-tick update. Diffs `instance` against cached state and forwards
    /// changes; recomputes panning maps when the emitter moved beyond the
    /// configured azimuth epsilon or a speaker-map refresh was requested.
    pub fn update(&mut self, instance: &WaveInstance) {
        if self.state != SourceState::Initialized {
            return;
        }
        let rate_ratio = self.rate_ratio();
        let Some(voice) = self.voice.as_mut() else {
            return;
        };

        voice.set_volume(instance.volume);
        voice.set_distance_attenuation(instance.distance_attenuation);
        voice.set_pitch(instance.pitch * rate_ratio);
        voice.set_lpf_frequency(instance.lpf_frequency);
        voice.set_hpf_frequency(instance.hpf_frequency);

        let mut maps_dirty = false;
        for send in &instance.submix_sends {
            voice.set_submix_send(send.submix, send.level);
            if let Some(layout) = self.handle.submix_layout(send.submix) {
                if !self.send_layouts.contains(&layout) {
                    self.send_layouts.push(layout);
                    maps_dirty = true;
                }
            }
        }
        for send in &instance.bus_sends {
            voice.set_bus_send(send.bus, send.level);
        }

        if self.hrtf_active {
            let params = spat_params_of(instance);
            if params != self.last_spat {
                self.last_spat = params;
                voice.set_spatialization_params(params);
            }
        } else if self.spatialized {
            let azimuths = Self::current_azimuths(self.num_channels, instance);
            let epsilon = self.handle.config().azimuth_epsilon_degrees;
            let moved = (azimuths.0 - self.last_azimuths.0).abs() > epsilon
                || (azimuths.1 - self.last_azimuths.1).abs() > epsilon;
            if voice.take_needs_speaker_map() || maps_dirty || moved {
                self.last_azimuths = azimuths;
                for &layout in &self.send_layouts {
                    if let Some(map) = Self::panned_map(self.num_channels, azimuths, layout) {
                        voice.set_channel_map(map.layout, &map.gains);
                    }
                }
            }
        }

        let loops = voice.loop_count();
        if loops > self.last_loop_count {
            let wraps = loops - self.last_loop_count;
            self.last_loop_count = loops;
            if let Some(on_loop) = self.on_loop.as_mut() {
                for _ in 0..wraps {
                    on_loop();
                }
            }
        }
    }

    /// Called once per loop wrap observed during `update`.
    pub fn set_on_loop(&mut self, callback: impl FnMut() + Send + 'static) {
        self.on_loop = Some(Box::new(callback));
    }

    pub fn play(&mut self) {
        if let Some(voice) = self.voice.as_mut() {
            voice.play();
        }
    }

    pub fn pause(&mut self) {
        if let Some(voice) = self.voice.as_mut() {
            voice.pause();
        }
    }

    pub fn stop(&mut self) {
        if let Some(voice) = self.voice.as_mut() {
            voice.stop();
        }
    }

    pub fn stop_with_fade(&mut self, fade_frames: Option<u32>) {
        if let Some(voice) = self.voice.as_mut() {
            voice.stop_with_fade(fade_frames);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.voice.as_ref().is_some_and(|v| v.is_playing())
    }

    pub fn is_paused(&self) -> bool {
        self.voice.as_ref().is_some_and(|v| v.is_paused())
    }

    pub fn is_initialized(&self) -> bool {
        self.state == SourceState::Initialized
    }

    /// Input consumed (or stopped) and any effect tails rung out.
    pub fn is_finished(&self) -> bool {
        self.voice.as_ref().is_some_and(|v| v.is_finished())
    }

    pub fn frames_played(&self) -> u64 {
        self.voice.as_ref().map_or(0, |v| v.frames_played())
    }

    pub fn envelope_value(&self) -> f32 {
        self.voice.as_ref().map_or(0.0, |v| v.envelope_value())
    }

    pub fn loop_count(&self) -> u32 {
        self.voice.as_ref().map_or(0, |v| v.loop_count())
    }

    /// Progress through the asset as a fraction of its length. Exceeds 1.0
    /// once a looping source wraps; open-ended sources report 0.
    pub fn playback_percent(&self) -> f32 {
        match self.total_frames {
            Some(total) if total > 0 => self.frames_played() as f32 / total as f32,
            _ => 0.0,
        }
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Hand the slot back. Dropping does the same.
    pub fn release(&mut self) {
        self.voice = None;
        self.buffer = None;
        self.effects.clear();
        self.state = SourceState::Released;
    }

    fn rate_ratio(&self) -> f32 {
        self.wave_sample_rate as f32 / self.handle.config().sample_rate.as_f32()
    }

    /// Azimuths to pan a source's channels at, from listener geometry.
    fn current_azimuths(num_channels: usize, instance: &WaveInstance) -> (f32, f32) {
        if num_channels == 2 {
            stereo_spread_azimuths(
                instance.azimuth_degrees,
                instance.stereo_spread,
                instance.listener_distance,
            )
        } else {
            (instance.azimuth_degrees, instance.azimuth_degrees)
        }
    }

    /// Panning channel map into `layout` for the given azimuths. Sources
    /// wider than stereo keep the default fold maps and return `None`.
    fn panned_map(
        num_channels: usize,
        azimuths: (f32, f32),
        layout: ChannelLayout,
    ) -> Option<ChannelMapParam> {
        let dst = layout.num_channels();
        match num_channels {
            1 => {
                let mut gains: SmallVec<[Sample; 16]> = SmallVec::new();
                gains.resize(dst, 0.0);
                compute_panning_gains(azimuths.0, layout, &mut gains);
                Some(ChannelMapParam { layout, gains })
            }
            2 => {
                let mut gains: SmallVec<[Sample; 16]> = SmallVec::new();
                gains.resize(2 * dst, 0.0);
                compute_panning_gains(azimuths.0, layout, &mut gains[..dst]);
                compute_panning_gains(azimuths.1, layout, &mut gains[dst..]);
                Some(ChannelMapParam { layout, gains })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, PcmData, SourceManager};
    use std::sync::Arc;

    fn test_config() -> EngineConfig {
        EngineConfig {
            num_sources: 2,
            num_decode_workers: 1,
            ..Default::default()
        }
    }

    fn pcm_source(frames: usize, sample_rate: u32) -> WaveSource {
        WaveSource::RawPcm {
            data: Arc::new(PcmData::new(vec![0.5; frames], 1, sample_rate).expect("pcm")),
        }
    }

    #[test]
    fn test_lifecycle_prepare_init_play_finish() {
        let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");
        let mut source = MixerSource::new(handle);

        source
            .prepare(pcm_source(256, 48000), LoopingMode::None, Vec::new(), false)
            .expect("prepare");
        assert!(source.is_prepared_to_init());

        let instance = WaveInstance::default();
        assert!(source.init(&instance).expect("init"));
        assert!(source.is_initialized());

        source.play();
        manager.render_block();

        assert_eq!(source.frames_played(), 256);
        assert!(source.is_finished());
        assert!((source.playback_percent() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_rejects_wrong_state() {
        let (_manager, handle) = SourceManager::new(test_config(), None).expect("manager");
        let mut source = MixerSource::new(handle);
        source
            .prepare(pcm_source(64, 48000), LoopingMode::None, Vec::new(), false)
            .expect("prepare");
        let again = source.prepare(pcm_source(64, 48000), LoopingMode::None, Vec::new(), false);
        assert!(matches!(again, Err(SourceError::NotReady)));
    }

    #[test]
    fn test_init_without_prepare_is_not_ready() {
        let (_manager, handle) = SourceManager::new(test_config(), None).expect("manager");
        let mut source = MixerSource::new(handle);
        assert!(matches!(
            source.init(&WaveInstance::default()),
            Err(SourceError::NotReady)
        ));
    }

    #[test]
    fn test_pool_exhaustion_keeps_source_prepared() {
        let config = EngineConfig {
            num_sources: 1,
            ..test_config()
        };
        let (_manager, handle) = SourceManager::new(config, None).expect("manager");

        // Occupy the only slot.
        let taken = handle.get_free_source_id().expect("slot");

        let mut source = MixerSource::new(handle.clone());
        source
            .prepare(pcm_source(64, 48000), LoopingMode::None, Vec::new(), false)
            .expect("prepare");
        assert!(matches!(source.init(&WaveInstance::default()), Ok(false)));
        assert!(!source.is_initialized());

        handle.return_free_id(taken);
        assert!(matches!(source.init(&WaveInstance::default()), Ok(true)));
        assert!(source.is_initialized());
    }

    #[test]
    fn test_wave_rate_folds_into_pitch() {
        let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");
        let mut source = MixerSource::new(handle);

        // 24 kHz wave on a 48 kHz engine runs at half read speed.
        source
            .prepare(pcm_source(300, 24000), LoopingMode::None, Vec::new(), false)
            .expect("prepare");
        assert!(source.init(&WaveInstance::default()).expect("init"));
        source.play();
        manager.render_block();

        // Two priming frames plus one source frame every second output frame.
        assert_eq!(source.frames_played(), 258);
        assert!(!source.is_finished());
    }

    #[test]
    fn test_release_is_terminal() {
        let (_manager, handle) = SourceManager::new(test_config(), None).expect("manager");
        let mut source = MixerSource::new(handle);
        source
            .prepare(pcm_source(64, 48000), LoopingMode::None, Vec::new(), false)
            .expect("prepare");
        source.release();
        assert!(matches!(
            source.prepare(pcm_source(64, 48000), LoopingMode::None, Vec::new(), false),
            Err(SourceError::NotReady)
        ));
    }
}
