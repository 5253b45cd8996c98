//! End-to-end source engine tests
//!
//! Drives a `SourceManager` the way a game would, across both threads:
//! - Slot pool claim, exhaustion, deferred release and id reuse
//! - Command ordering within a single render block
//! - Mixing into the device submix, custom submixes and audio buses
//! - Stop fades, natural completion and effect tails
//! - Underruns, pausing, loop counting and envelope publication
//! - Object (HRTF) spatialization hand-off and release notification
//! - Speaker map refresh round trip through `MixerSource`

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use onda_core::{BusId, ChannelLayout, Sample, SourceId, SubmixId};
use onda_engine::{
    BusSendParam, DEVICE_SUBMIX, DecodeProgress, EngineConfig, LoopingMode, MixerSource, PcmData,
    SourceBuffer, SourceEffect, SourceInitArgs, SourceManager, SourceManagerHandle,
    SpatializationParams, Spatializer, StreamingDecoder, SubmixSendParam, WaveFormat, WaveInstance,
    WaveSource,
};
use smallvec::smallvec;

const BLOCK_FRAMES: usize = 512;
/// Default mono-to-stereo fold is an equal-power center pan.
const CENTER_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn test_config() -> EngineConfig {
    EngineConfig {
        num_sources: 4,
        num_decode_workers: 1,
        ..Default::default()
    }
}

/// Mono DC at `value`, fully resident.
fn dc_source(value: Sample, frames: usize) -> WaveSource {
    WaveSource::RawPcm {
        data: Arc::new(PcmData::new(vec![value; frames], 1, 48000).expect("valid pcm")),
    }
}

fn make_buffer(
    handle: &SourceManagerHandle,
    source: WaveSource,
    looping: LoopingMode,
) -> SourceBuffer {
    SourceBuffer::new(
        source,
        looping,
        handle.config().chunk_frames,
        handle.decode_scheduler(),
    )
    .expect("buffer")
}

/// Claim a slot and initialize a mono DC source with a unity send to the
/// device submix. The caller decides when to play it.
fn init_dc(
    handle: &SourceManagerHandle,
    value: Sample,
    frames: usize,
    looping: LoopingMode,
) -> SourceId {
    let id = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(handle, dc_source(value, frames), looping)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    id
}

/// Mono decoder whose first decode blocks for `delay`, producing one DC
/// chunk; the second call reports end of stream.
struct DelayedDecoder {
    delay: Duration,
    value: Sample,
    decodes: u32,
}

impl DelayedDecoder {
    fn new(delay: Duration, value: Sample) -> Self {
        Self {
            delay,
            value,
            decodes: 0,
        }
    }
}

impl StreamingDecoder for DelayedDecoder {
    fn format(&self) -> WaveFormat {
        WaveFormat {
            num_channels: 1,
            sample_rate: 48000,
            num_frames: None,
        }
    }

    fn decode(&mut self, out: &mut [Sample], _looping: LoopingMode) -> DecodeProgress {
        self.decodes += 1;
        if self.decodes == 1 {
            thread::sleep(self.delay);
            out.fill(self.value);
            DecodeProgress {
                frames_written: out.len(),
                looped: false,
                finished: false,
            }
        } else {
            DecodeProgress {
                frames_written: 0,
                looped: false,
                finished: true,
            }
        }
    }

    fn seek_to_frame(&mut self, _frame: u64) {}
}

/// Pass-through effect whose tail rings for a fixed number of blocks.
struct RingOutEffect {
    calls: u32,
    ring_blocks: u32,
}

impl SourceEffect for RingOutEffect {
    fn process(&mut self, _buffer: &mut [Sample], _num_channels: usize) {
        self.calls += 1;
    }

    fn tails_done(&self) -> bool {
        self.calls >= self.ring_blocks
    }
}

#[derive(Default)]
struct SpatSpyState {
    set_params_calls: AtomicU32,
    process_calls: AtomicU32,
    release_calls: AtomicU32,
    released_id: AtomicU32,
}

/// Spatializer stub: copies the mono input to both output channels at half
/// gain and counts every callback.
struct SpatSpy {
    state: Arc<SpatSpyState>,
}

impl Spatializer for SpatSpy {
    fn set_params(&mut self, _source: SourceId, _params: &SpatializationParams) {
        self.state.set_params_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn process(&mut self, _source: SourceId, input: &[Sample], output: &mut [Sample]) {
        self.state.process_calls.fetch_add(1, Ordering::Relaxed);
        for (i, sample) in input.iter().enumerate() {
            output[i * 2] = *sample * 0.5;
            output[i * 2 + 1] = *sample * 0.5;
        }
    }

    fn on_release(&mut self, source: SourceId) {
        self.state.release_calls.fetch_add(1, Ordering::Relaxed);
        self.state.released_id.store(source.0, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SLOT POOL LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_pool_hands_out_all_slots_then_recycles() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let ids: Vec<SourceId> = (0..4)
        .map(|_| init_dc(&handle, 0.1, 4096, LoopingMode::None))
        .collect();
    assert_eq!(handle.get_free_source_id(), None, "pool should be exhausted");

    manager.render_block();
    assert_eq!(manager.num_active_sources(), 4);
    assert_eq!(manager.stats().sources_initialized(), 4);

    // Resident PCM has no decode task outstanding, so the release lands in
    // one block.
    handle.release_source(ids[1]);
    manager.render_block();

    assert_eq!(manager.stats().sources_released(), 1);
    assert!(!handle.is_busy(ids[1]), "released id should be un-busy");
    assert_eq!(
        handle.get_free_source_id(),
        Some(ids[1]),
        "released id should be reusable"
    );
    // Claiming marks the slot busy again for the next init.
    assert!(handle.is_busy(ids[1]));
}

#[test]
fn test_release_waits_for_outstanding_decode() {
    let config = EngineConfig {
        num_sources: 1,
        ..test_config()
    };
    let (mut manager, handle) = SourceManager::new(config, None).expect("manager");

    let id = handle.get_free_source_id().expect("free slot");
    let source = WaveSource::Streaming {
        decoder: Box::new(DelayedDecoder::new(Duration::from_millis(300), 0.25)),
        cached_first_chunk: None,
    };
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, source, LoopingMode::None)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.release_source(id);

    // The first decode is still sleeping on the worker; the slot must stay
    // claimed until that task comes home.
    manager.render_block();
    assert!(handle.is_busy(id), "slot freed while a decode was in flight");
    assert_eq!(handle.get_free_source_id(), None);

    let mut recycled = None;
    for _ in 0..400 {
        manager.render_block();
        if let Some(free) = handle.get_free_source_id() {
            recycled = Some(free);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(recycled, Some(id), "slot never came back after the decode");
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIXING INTO SUBMIXES AND BUSES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_mono_source_mixes_center_into_device() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 4096, LoopingMode::None);
    handle.play(id);

    manager.render_block();
    manager.render_block();

    let device = manager.device_buffer();
    assert_eq!(device.len(), BLOCK_FRAMES * 2);
    assert_relative_eq!(device[200], 0.5 * CENTER_GAIN, epsilon = 1e-4);
    assert_relative_eq!(device[201], 0.5 * CENTER_GAIN, epsilon = 1e-4);
    assert_eq!(manager.num_active_sources(), 1);
}

#[test]
fn test_sources_sum_into_the_device_mix() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    for value in [0.2, 0.3] {
        let id = init_dc(&handle, value, 4096, LoopingMode::None);
        handle.play(id);
    }

    manager.render_block();
    manager.render_block();

    let device = manager.device_buffer();
    assert_relative_eq!(device[200], 0.5 * CENTER_GAIN, epsilon = 1e-4);
    assert_relative_eq!(device[201], 0.5 * CENTER_GAIN, epsilon = 1e-4);
}

#[test]
fn test_custom_submix_is_isolated_from_device() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");
    let aux = SubmixId(3);
    handle.register_submix(aux, ChannelLayout::Mono).expect("register");

    let id = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, dc_source(0.5, 4096), LoopingMode::None)),
        submix_sends: smallvec![SubmixSendParam {
            submix: aux,
            level: 0.5,
        }],
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.play(id);

    manager.render_block();
    manager.render_block();

    let aux_buffer = manager.submix_buffer(aux).expect("aux submix");
    assert_eq!(aux_buffer.len(), BLOCK_FRAMES);
    assert_relative_eq!(aux_buffer[100], 0.25, epsilon = 1e-4);
    assert!(
        manager.device_buffer().iter().all(|s| *s == 0.0),
        "device mix should be untouched"
    );
}

#[test]
fn test_bus_send_taps_before_distance_attenuation() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");
    let bus = BusId(7);
    handle.register_bus(bus, 1).expect("register bus");

    // Feeding source: volume is part of the bus tap, distance attenuation
    // is not.
    let feeder = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, dc_source(0.5, 16384), LoopingMode::None)),
        volume: 0.8,
        distance_attenuation: 0.25,
        bus_sends: smallvec![BusSendParam { bus, level: 1.0 }],
        ..Default::default()
    };
    handle.init_source(feeder, args).expect("init feeder");

    // Bus-input source forwarding the bus to the device.
    let consumer = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        bus_input: Some(bus),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        ..Default::default()
    };
    handle.init_source(consumer, args).expect("init consumer");

    handle.play(feeder);
    handle.play(consumer);

    manager.render_block();
    manager.render_block();

    // 0.5 * 0.8 through the bus, center-panned into stereo. A post-
    // attenuation tap would have landed at a quarter of this.
    let device = manager.device_buffer();
    assert_relative_eq!(device[200], 0.4 * CENTER_GAIN, epsilon = 1e-4);
    assert_relative_eq!(device[201], 0.4 * CENTER_GAIN, epsilon = 1e-4);
}

// ═══════════════════════════════════════════════════════════════════════════════
// STOP SEMANTICS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_same_block_play_then_stop_never_sounds() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 4096, LoopingMode::None);
    handle.play(id);
    handle.stop(id);

    manager.render_block();

    assert!(handle.is_done(id), "hard stop should complete immediately");
    assert_eq!(handle.frames_played(id), 0);
    assert!(manager.device_buffer().iter().all(|s| *s == 0.0));
    // The slot stays claimed until explicitly released.
    assert!(handle.is_busy(id));
}

#[test]
fn test_stop_fade_finishes_within_the_faded_block() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 8192, LoopingMode::Loop);
    handle.play(id);
    manager.render_block();
    assert!(manager.device_buffer()[200].abs() > 0.3, "source should be audible");
    assert!(!handle.is_done(id));

    // A 256-frame fade completes inside one 512-frame block.
    handle.stop_with_fade(id, Some(256));
    manager.render_block();
    assert!(handle.is_done(id), "fade should have run to completion");

    let frames_at_done = handle.frames_played(id);
    manager.render_block();
    assert!(manager.device_buffer().iter().all(|s| *s == 0.0));
    assert_eq!(handle.frames_played(id), frames_at_done);
}

#[test]
fn test_hard_stop_promotes_over_a_running_fade() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 8192, LoopingMode::Loop);
    handle.play(id);
    manager.render_block();

    // An eight-block fade is still running after one block.
    handle.stop_with_fade(id, Some(4096));
    manager.render_block();
    assert!(!handle.is_done(id), "fade should still be in progress");
    assert!(manager.device_buffer()[200].abs() > 0.3, "fading source should still sound");
    let frames_mid_fade = handle.frames_played(id);

    handle.stop(id);
    manager.render_block();
    assert!(handle.is_done(id), "stop should cut the fade short");
    assert!(manager.device_buffer().iter().all(|s| *s == 0.0));
    assert_eq!(handle.frames_played(id), frames_mid_fade);
}

// ═══════════════════════════════════════════════════════════════════════════════
// EFFECT TAILS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_natural_end_holds_slot_for_effect_tails() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, dc_source(0.5, 512), LoopingMode::None)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        effects: vec![Box::new(RingOutEffect {
            calls: 0,
            ring_blocks: 6,
        })],
        play_effect_tails: true,
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.play(id);

    let mut saw_ringing_tail = false;
    for _ in 0..12 {
        manager.render_block();
        if handle.is_done(id) && !handle.is_effect_tails_done(id) {
            saw_ringing_tail = true;
            assert!(handle.is_busy(id));
        }
        if handle.is_effect_tails_done(id) {
            break;
        }
    }

    assert!(saw_ringing_tail, "input should finish before the tail does");
    assert!(handle.is_done(id));
    assert!(handle.is_effect_tails_done(id));
    // A 512-frame asset plays in exactly one block; the tail adds no frames.
    assert_eq!(handle.frames_played(id), 512);
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNDERRUNS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_starved_source_zero_fills_and_counts_underruns() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = handle.get_free_source_id().expect("free slot");
    let source = WaveSource::Streaming {
        decoder: Box::new(DelayedDecoder::new(Duration::from_millis(250), 0.5)),
        cached_first_chunk: None,
    };
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, source, LoopingMode::None)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.play(id);

    // The first chunk is still decoding; both blocks starve to silence.
    manager.render_block();
    manager.render_block();
    assert!(manager.device_buffer().iter().all(|s| *s == 0.0));
    assert!(manager.stats().underruns() >= 2);

    let mut audible = false;
    for _ in 0..400 {
        manager.render_block();
        if manager.device_buffer()[200].abs() > 0.2 {
            audible = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(audible, "source never recovered after the decode landed");
    assert!(handle.frames_played(id) > 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOOPING, PAUSE AND ENVELOPE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_looping_source_publishes_wraps() {
    let config = EngineConfig {
        chunk_frames: 512,
        ..test_config()
    };
    let (mut manager, handle) = SourceManager::new(config, None).expect("manager");

    // 256-frame asset wraps inside every 512-frame chunk.
    let id = init_dc(&handle, 0.5, 256, LoopingMode::Loop);
    handle.play(id);

    for _ in 0..10 {
        manager.render_block();
        thread::sleep(Duration::from_millis(5));
    }

    assert!(
        handle.loop_count(id) >= 2,
        "expected loop wraps, got {}",
        handle.loop_count(id)
    );
    assert!(handle.frames_played(id) > 256);
    assert!(!handle.is_done(id));
}

#[test]
fn test_pause_freezes_frames_played() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 8192, LoopingMode::Loop);
    handle.play(id);
    manager.render_block();
    manager.render_block();
    let frames_before_pause = handle.frames_played(id);
    assert!(frames_before_pause > 0);

    handle.pause(id);
    manager.render_block();
    manager.render_block();
    assert_eq!(handle.frames_played(id), frames_before_pause);

    handle.play(id);
    manager.render_block();
    assert!(handle.frames_played(id) > frames_before_pause);
}

#[test]
fn test_envelope_follows_the_playing_signal() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let id = init_dc(&handle, 0.5, 8192, LoopingMode::Loop);
    manager.render_block();
    assert_eq!(handle.envelope_value(id), 0.0, "idle source has no envelope");

    handle.play(id);
    for _ in 0..4 {
        manager.render_block();
    }

    // ~43 ms of DC at 0.5 through a 10 ms attack sits just under the peak.
    let envelope = handle.envelope_value(id);
    assert!(envelope > 0.3, "envelope too low: {envelope}");
    assert!(envelope <= 0.55, "envelope overshoot: {envelope}");
}

// ═══════════════════════════════════════════════════════════════════════════════
// OBJECT SPATIALIZATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_hrtf_source_routes_through_spatializer() {
    let state = Arc::new(SpatSpyState::default());
    let spy = SpatSpy {
        state: Arc::clone(&state),
    };
    let (mut manager, handle) =
        SourceManager::new(test_config(), Some(Box::new(spy))).expect("manager");
    assert!(handle.object_spatialization_available());

    let id = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, dc_source(0.5, 16384), LoopingMode::None)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        use_object_spatialization: true,
        spatialization: SpatializationParams {
            azimuth_degrees: 45.0,
            distance: 2.0,
            ..Default::default()
        },
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.play(id);

    manager.render_block();
    manager.render_block();

    assert_eq!(state.set_params_calls.load(Ordering::Relaxed), 1);
    assert_eq!(state.process_calls.load(Ordering::Relaxed), 2);
    // The spy halves the mono input into both channels; the stereo output
    // passes to the device through an identity map.
    let device = manager.device_buffer();
    assert_relative_eq!(device[200], 0.25, epsilon = 1e-4);
    assert_relative_eq!(device[201], 0.25, epsilon = 1e-4);

    handle.release_source(id);
    manager.render_block();
    assert_eq!(state.release_calls.load(Ordering::Relaxed), 1);
    assert_eq!(state.released_id.load(Ordering::Relaxed), id.0);
    assert!(!handle.is_busy(id));
}

#[test]
fn test_channel_map_is_ignored_for_object_spatialized_sources() {
    let state = Arc::new(SpatSpyState::default());
    let spy = SpatSpy {
        state: Arc::clone(&state),
    };
    let (mut manager, handle) =
        SourceManager::new(test_config(), Some(Box::new(spy))).expect("manager");

    let id = handle.get_free_source_id().expect("free slot");
    let args = SourceInitArgs {
        buffer: Some(make_buffer(&handle, dc_source(0.5, 8192), LoopingMode::Loop)),
        submix_sends: smallvec![SubmixSendParam {
            submix: DEVICE_SUBMIX,
            level: 1.0,
        }],
        use_object_spatialization: true,
        spatialization: SpatializationParams {
            azimuth_degrees: 45.0,
            distance: 2.0,
            ..Default::default()
        },
        ..Default::default()
    };
    handle.init_source(id, args).expect("init");
    handle.play(id);
    manager.render_block();
    manager.render_block();
    let baseline = manager.device_buffer()[200];
    assert_relative_eq!(baseline, 0.25, epsilon = 1e-4);

    // Panning maps do not apply to a spatialized source; the spatializer
    // output keeps flowing through the shared post-HRTF maps.
    handle.set_channel_map(id, ChannelLayout::Stereo, &[0.0, 0.0]);
    manager.render_block();
    assert_relative_eq!(manager.device_buffer()[200], baseline, epsilon = 1e-4);
    assert_relative_eq!(manager.device_buffer()[201], baseline, epsilon = 1e-4);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPEAKER MAP REFRESH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_speaker_map_refresh_resubmits_panning() {
    let (mut manager, handle) = SourceManager::new(test_config(), None).expect("manager");

    let mut source = MixerSource::new(handle.clone());
    source
        .prepare(dc_source(0.5, 8192), LoopingMode::Loop, Vec::new(), false)
        .expect("prepare");
    assert!(source.is_prepared_to_init());

    let instance = WaveInstance {
        spatialized: true,
        azimuth_degrees: 30.0,
        ..Default::default()
    };
    assert!(matches!(source.init(&instance), Ok(true)));
    source.play();
    manager.render_block();
    let baseline = manager.stats().commands_processed();

    // Nothing moved: the update pushes no commands.
    source.update(&instance);
    manager.render_block();
    assert_eq!(manager.stats().commands_processed(), baseline);

    // A refresh forces the map to be recomputed and resubmitted even though
    // the emitter itself is stationary.
    handle.request_speaker_map_refresh();
    source.update(&instance);
    manager.render_block();
    assert_eq!(manager.stats().commands_processed(), baseline + 1);
}
