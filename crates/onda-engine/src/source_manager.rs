//! Fixed-pool source rendering core.
//!
//! `SourceManager` owns every source slot and runs the whole per-block
//! pipeline on the render thread; `SourceManagerHandle` is the game-thread
//! endpoint that claims slots, validates init parameters and pushes
//! commands. The two sides meet through the double-buffered command queue,
//! per-slot atomic snapshots and a release-acknowledge ring.
//!
//! Block order: drain commands, poll decode replies, finalize pending
//! releases, clear mix targets, generate buffer-input sources (optionally
//! across a worker pool), run object spatialization, accumulate bus sends,
//! generate bus-input sources, accumulate submix sends, publish snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use onda_core::{
    BusId, ChannelLayout, MAX_CHANNELS, OndaResult, Sample, SourceId, SubmixId,
};
use onda_dsp::{EnvelopeFollower, MAX_FILTER_FREQUENCY, OnePoleHpf, OnePoleLpf, Ramp};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::{
    BusInstance, BusSendParam, ChannelGainMap, ChannelMapParam, CommandQueue, DEVICE_SUBMIX,
    DecodePool, DecodeScheduler, EngineConfig, FrameCursor, InitCommand, SourceBuffer,
    SourceCommand, SourceEffect, SourceError, SpatializationParams, Spatializer, Submix,
    SubmixSendParam, UnderrunMode, mix_fold,
};

/// Upper bound on pitch accepted from game code.
pub const MAX_PITCH: f32 = 4.0;

/// Per-slot state published by the render thread and polled lock-free from
/// the game thread.
pub(crate) struct SlotShared {
    busy: AtomicBool,
    initialized: AtomicBool,
    done: AtomicBool,
    effect_tails_done: AtomicBool,
    needs_speaker_map: AtomicBool,
    frames_played: AtomicU64,
    envelope: AtomicU32,
    loop_count: AtomicU32,
}

impl SlotShared {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            done: AtomicBool::new(false),
            effect_tails_done: AtomicBool::new(false),
            needs_speaker_map: AtomicBool::new(false),
            frames_played: AtomicU64::new(0),
            envelope: AtomicU32::new(0),
            loop_count: AtomicU32::new(0),
        }
    }

    /// Game-side reset when the id leaves the free pool. The render thread
    /// is not touching the slot while it is unclaimed.
    fn reset_for_claim(&self) {
        self.initialized.store(false, Ordering::Relaxed);
        self.done.store(false, Ordering::Relaxed);
        self.effect_tails_done.store(false, Ordering::Relaxed);
        self.needs_speaker_map.store(false, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);
        self.envelope.store(0, Ordering::Relaxed);
        self.loop_count.store(0, Ordering::Relaxed);
        self.busy.store(true, Ordering::Release);
    }
}

/// Lock-free render counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    blocks_rendered: AtomicU64,
    commands_processed: AtomicU64,
    sources_initialized: AtomicU64,
    sources_released: AtomicU64,
    underruns: AtomicU64,
    active_sources: AtomicUsize,
}

impl EngineStats {
    pub fn blocks_rendered(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Relaxed)
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    pub fn sources_initialized(&self) -> u64 {
        self.sources_initialized.load(Ordering::Relaxed)
    }

    pub fn sources_released(&self) -> u64 {
        self.sources_released.load(Ordering::Relaxed)
    }

    /// Blocks in which a playing source ran out of decoded audio.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Active slot count as of the last rendered block.
    pub fn active_sources(&self) -> usize {
        self.active_sources.load(Ordering::Relaxed)
    }
}

/// Everything a source needs at init. Built per sound and consumed by
/// [`SourceManagerHandle::init_source`].
pub struct SourceInitArgs {
    /// Decoded-audio input. Exactly one of `buffer`/`bus_input` is set.
    pub buffer: Option<SourceBuffer>,
    /// Consume an audio bus instead of a buffer.
    pub bus_input: Option<BusId>,
    pub volume: f32,
    /// Distance/occlusion gain, applied after the bus-send tap.
    pub distance_attenuation: f32,
    /// Effective pitch including any wave-to-engine sample rate ratio.
    pub pitch: f32,
    pub lpf_frequency: f32,
    pub hpf_frequency: f32,
    pub submix_sends: SmallVec<[SubmixSendParam; 2]>,
    pub bus_sends: SmallVec<[BusSendParam; 2]>,
    /// Initial gain maps; layouts without one get a default at init.
    pub channel_maps: SmallVec<[ChannelMapParam; 2]>,
    pub use_object_spatialization: bool,
    pub spatialization: SpatializationParams,
    pub effects: Vec<Box<dyn SourceEffect>>,
    /// Keep rendering silence through the effects after the input ends,
    /// until every effect reports its tail done.
    pub play_effect_tails: bool,
}

impl Default for SourceInitArgs {
    fn default() -> Self {
        Self {
            buffer: None,
            bus_input: None,
            volume: 1.0,
            distance_attenuation: 1.0,
            pitch: 1.0,
            lpf_frequency: MAX_FILTER_FREQUENCY,
            hpf_frequency: 0.0,
            submix_sends: SmallVec::new(),
            bus_sends: SmallVec::new(),
            channel_maps: SmallVec::new(),
            use_object_spatialization: false,
            spatialization: SpatializationParams::default(),
            effects: Vec::new(),
            play_effect_tails: false,
        }
    }
}

struct HandleShared {
    commands: CommandQueue,
    slots: Vec<Arc<SlotShared>>,
    free_ids: Mutex<Vec<SourceId>>,
    release_acks: Mutex<rtrb::Consumer<SourceId>>,
    scheduler: DecodeScheduler,
    stats: Arc<EngineStats>,
    config: EngineConfig,
    submix_layouts: RwLock<HashMap<SubmixId, ChannelLayout>>,
    bus_channels: RwLock<HashMap<BusId, usize>>,
    hrtf_available: bool,
}

/// Game-thread endpoint of the source manager. Cheap to clone; all methods
/// are wait-free against the render thread.
#[derive(Clone)]
pub struct SourceManagerHandle {
    shared: Arc<HandleShared>,
}

impl SourceManagerHandle {
    /// Claim a free source slot. `None` means the pool is exhausted, a
    /// normal steady-state condition callers retry next tick.
    pub fn get_free_source_id(&self) -> Option<SourceId> {
        let mut free = self.shared.free_ids.lock();
        {
            let mut acks = self.shared.release_acks.lock();
            while let Ok(id) = acks.pop() {
                free.push(id);
            }
        }
        let id = free.pop()?;
        self.shared.slots[id.index()].reset_for_claim();
        Some(id)
    }

    /// Give back a claimed id that never reached init.
    pub fn return_free_id(&self, id: SourceId) {
        let Some(slot) = self.shared.slots.get(id.index()) else {
            return;
        };
        slot.busy.store(false, Ordering::Release);
        self.shared.free_ids.lock().push(id);
    }

    /// Validate and enqueue source initialization on a claimed id.
    ///
    /// On a validation error the id goes back to the free pool and the
    /// buffer (with any procedural claim) is dropped, so callers abandon
    /// the sound rather than retry.
    pub fn init_source(&self, id: SourceId, mut args: SourceInitArgs) -> Result<(), SourceError> {
        let slot = self
            .shared
            .slots
            .get(id.index())
            .ok_or(SourceError::InvalidSourceId(id))?;
        if !slot.busy.load(Ordering::Acquire) {
            return Err(SourceError::InvalidSourceId(id));
        }
        if slot.initialized.load(Ordering::Relaxed) {
            return Err(SourceError::SlotBusy(id));
        }

        let (hrtf, num_channels) = match self.validate_args(&args) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.return_free_id(id);
                return Err(e);
            }
        };
        Self::sanitize_args(&mut args);

        slot.initialized.store(true, Ordering::Relaxed);
        self.shared
            .stats
            .sources_initialized
            .fetch_add(1, Ordering::Relaxed);
        self.shared.commands.push(SourceCommand::Init {
            id,
            init: Box::new(InitCommand {
                args,
                hrtf,
                num_channels,
            }),
        });
        Ok(())
    }

    fn validate_args(&self, args: &SourceInitArgs) -> Result<(bool, usize), SourceError> {
        let num_channels = match (&args.buffer, args.bus_input) {
            (Some(buffer), None) => buffer.num_channels(),
            (None, Some(bus)) => self
                .shared
                .bus_channels
                .read()
                .get(&bus)
                .copied()
                .ok_or_else(|| {
                    SourceError::InvalidFormat(format!("bus {bus} is not registered"))
                })?,
            _ => return Err(SourceError::MissingInput),
        };

        {
            let layouts = self.shared.submix_layouts.read();
            for send in &args.submix_sends {
                if !layouts.contains_key(&send.submix) {
                    return Err(SourceError::InvalidFormat(format!(
                        "submix {} is not registered",
                        send.submix
                    )));
                }
            }
        }
        {
            let buses = self.shared.bus_channels.read();
            for send in &args.bus_sends {
                if !buses.contains_key(&send.bus) {
                    return Err(SourceError::InvalidFormat(format!(
                        "bus {} is not registered",
                        send.bus
                    )));
                }
            }
        }
        if args.bus_input.is_some() && !args.bus_sends.is_empty() {
            // A bus-input source sending back into a bus would need a block
            // of delay or a cycle check; neither is supported.
            return Err(SourceError::InvalidFormat(
                "bus-input sources cannot send to buses".into(),
            ));
        }
        for map in &args.channel_maps {
            let expected = num_channels * map.layout.num_channels();
            if map.gains.len() != expected {
                return Err(SourceError::InvalidFormat(format!(
                    "channel map for {} has {} gains, expected {}",
                    map.layout.name(),
                    map.gains.len(),
                    expected
                )));
            }
        }

        let hrtf = args.use_object_spatialization && self.shared.hrtf_available && num_channels == 1;
        if args.use_object_spatialization && !hrtf {
            log::debug!(
                "Object spatialization unavailable ({} channels, engine {}), using panning",
                num_channels,
                if self.shared.hrtf_available { "capable" } else { "disabled" }
            );
        }
        Ok((hrtf, num_channels))
    }

    fn sanitize_args(args: &mut SourceInitArgs) {
        args.volume = sanitize_gain(args.volume, 1.0);
        args.distance_attenuation = sanitize_gain(args.distance_attenuation, 1.0);
        args.pitch = sanitize_pitch(args.pitch);
        args.lpf_frequency = sanitize_frequency(args.lpf_frequency, MAX_FILTER_FREQUENCY);
        args.hpf_frequency = sanitize_frequency(args.hpf_frequency, 0.0);
        for send in &mut args.submix_sends {
            send.level = sanitize_gain(send.level, 0.0);
        }
        for send in &mut args.bus_sends {
            send.level = sanitize_gain(send.level, 0.0);
        }
    }

    pub fn play(&self, id: SourceId) {
        self.push_for(id, SourceCommand::Play { id });
    }

    pub fn pause(&self, id: SourceId) {
        self.push_for(id, SourceCommand::Pause { id });
    }

    /// Stop with no fade. Cuts effect tails as well.
    pub fn stop(&self, id: SourceId) {
        self.push_for(id, SourceCommand::Stop { id });
    }

    /// Stop behind a short fade; `None` uses the configured default length.
    pub fn stop_with_fade(&self, id: SourceId, fade_frames: Option<u32>) {
        let fade_frames = fade_frames
            .unwrap_or(self.shared.config.stop_fade_frames)
            .max(1);
        self.push_for(id, SourceCommand::StopFade { id, fade_frames });
    }

    pub fn set_volume(&self, id: SourceId, volume: f32) {
        let volume = sanitize_gain(volume, 1.0);
        self.push_for(id, SourceCommand::SetVolume { id, volume });
    }

    pub fn set_distance_attenuation(&self, id: SourceId, gain: f32) {
        let gain = sanitize_gain(gain, 1.0);
        self.push_for(id, SourceCommand::SetDistanceAttenuation { id, gain });
    }

    /// Ignored for bus-input sources, which always run at engine rate.
    pub fn set_pitch(&self, id: SourceId, pitch: f32) {
        let pitch = sanitize_pitch(pitch);
        self.push_for(id, SourceCommand::SetPitch { id, pitch });
    }

    pub fn set_lpf_frequency(&self, id: SourceId, frequency: f32) {
        let frequency = sanitize_frequency(frequency, MAX_FILTER_FREQUENCY);
        self.push_for(id, SourceCommand::SetLpfFrequency { id, frequency });
    }

    pub fn set_hpf_frequency(&self, id: SourceId, frequency: f32) {
        let frequency = sanitize_frequency(frequency, 0.0);
        self.push_for(id, SourceCommand::SetHpfFrequency { id, frequency });
    }

    /// Submit gains mixing the source into `layout`, packed source-major.
    pub fn set_channel_map(&self, id: SourceId, layout: ChannelLayout, gains: &[Sample]) {
        self.push_for(
            id,
            SourceCommand::SetChannelMap {
                id,
                map: ChannelMapParam {
                    layout,
                    gains: SmallVec::from_slice(gains),
                },
            },
        );
    }

    /// Add or retarget a send into `submix`. New sends fade in from zero.
    pub fn set_submix_send(&self, id: SourceId, submix: SubmixId, level: f32) {
        let level = sanitize_gain(level, 0.0);
        self.push_for(id, SourceCommand::SetSubmixSend { id, submix, level });
    }

    /// Add or retarget a pre-attenuation send into `bus`.
    pub fn set_bus_send(&self, id: SourceId, bus: BusId, level: f32) {
        let level = sanitize_gain(level, 0.0);
        self.push_for(id, SourceCommand::SetBusSend { id, bus, level });
    }

    pub fn set_spatialization_params(&self, id: SourceId, params: SpatializationParams) {
        self.push_for(id, SourceCommand::SetSpatializationParams { id, params });
    }

    /// Hand the slot back once the sound is finished with it. Teardown is
    /// deferred render-side until no decode task is in flight; the id
    /// returns through the acknowledge ring.
    pub fn release_source(&self, id: SourceId) {
        if self.is_busy(id) {
            self.shared
                .stats
                .sources_released
                .fetch_add(1, Ordering::Relaxed);
            self.shared.commands.push(SourceCommand::Release { id });
        }
    }

    /// Register a mix destination. The device submix exists from
    /// construction; re-registering with the same layout is a no-op.
    pub fn register_submix(
        &self,
        submix: SubmixId,
        layout: ChannelLayout,
    ) -> Result<(), SourceError> {
        {
            let mut layouts = self.shared.submix_layouts.write();
            match layouts.get(&submix) {
                Some(&existing) if existing == layout => return Ok(()),
                Some(&existing) => {
                    return Err(SourceError::InvalidFormat(format!(
                        "submix {submix} already registered as {}",
                        existing.name()
                    )));
                }
                None => {}
            }
            layouts.insert(submix, layout);
        }
        self.shared
            .commands
            .push(SourceCommand::RegisterSubmix { submix, layout });
        Ok(())
    }

    /// Register an audio bus with a fixed channel count.
    pub fn register_bus(&self, bus: BusId, num_channels: usize) -> Result<(), SourceError> {
        if num_channels == 0 || num_channels > MAX_CHANNELS {
            return Err(SourceError::InvalidFormat(format!(
                "unsupported bus channel count {num_channels}"
            )));
        }
        {
            let mut buses = self.shared.bus_channels.write();
            match buses.get(&bus) {
                Some(&existing) if existing == num_channels => return Ok(()),
                Some(&existing) => {
                    return Err(SourceError::InvalidFormat(format!(
                        "bus {bus} already registered with {existing} channels"
                    )));
                }
                None => {}
            }
            buses.insert(bus, num_channels);
        }
        self.shared
            .commands
            .push(SourceCommand::RegisterBus { bus, num_channels });
        Ok(())
    }

    /// Flag every busy slot so its owner recomputes and resubmits channel
    /// maps. Called when the output layout or speaker geometry changes.
    pub fn request_speaker_map_refresh(&self) {
        for slot in &self.shared.slots {
            if slot.busy.load(Ordering::Acquire) {
                slot.needs_speaker_map.store(true, Ordering::Release);
            }
        }
    }

    pub fn is_busy(&self, id: SourceId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.busy.load(Ordering::Acquire))
    }

    /// The source's input is fully consumed (or it was stopped).
    pub fn is_done(&self, id: SourceId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.done.load(Ordering::Acquire))
    }

    pub fn is_effect_tails_done(&self, id: SourceId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.effect_tails_done.load(Ordering::Acquire))
    }

    /// Source frames consumed since init.
    pub fn frames_played(&self, id: SourceId) -> u64 {
        self.slot(id)
            .map_or(0, |s| s.frames_played.load(Ordering::Relaxed))
    }

    /// Post-attenuation envelope of the source's last rendered block.
    pub fn envelope_value(&self, id: SourceId) -> f32 {
        self.slot(id)
            .map_or(0.0, |s| f32::from_bits(s.envelope.load(Ordering::Relaxed)))
    }

    /// Loop wraps consumed by playback since init.
    pub fn loop_count(&self, id: SourceId) -> u32 {
        self.slot(id)
            .map_or(0, |s| s.loop_count.load(Ordering::Relaxed))
    }

    /// Consume the speaker-map refresh flag for this slot.
    pub fn take_needs_speaker_map(&self, id: SourceId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.needs_speaker_map.swap(false, Ordering::AcqRel))
    }

    pub fn submix_layout(&self, submix: SubmixId) -> Option<ChannelLayout> {
        self.shared.submix_layouts.read().get(&submix).copied()
    }

    pub fn bus_num_channels(&self, bus: BusId) -> Option<usize> {
        self.shared.bus_channels.read().get(&bus).copied()
    }

    pub fn num_sources(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Scheduler for building [`SourceBuffer`]s against this engine's
    /// decode pool.
    pub fn decode_scheduler(&self) -> DecodeScheduler {
        self.shared.scheduler.clone()
    }

    pub fn object_spatialization_available(&self) -> bool {
        self.shared.hrtf_available
    }

    fn slot(&self, id: SourceId) -> Option<&Arc<SlotShared>> {
        self.shared.slots.get(id.index())
    }

    fn push_for(&self, id: SourceId, command: SourceCommand) {
        if self.is_busy(id) {
            self.shared.commands.push(command);
        } else {
            log::warn!("Dropping command for source {id} which is not in use");
        }
    }
}

fn sanitize_gain(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value.max(0.0) } else { fallback }
}

fn sanitize_pitch(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, MAX_PITCH)
    } else {
        1.0
    }
}

fn sanitize_frequency(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, MAX_FILTER_FREQUENCY)
    } else {
        fallback
    }
}

enum SourceInput {
    Buffer {
        buffer: SourceBuffer,
        cursor: FrameCursor,
    },
    Bus {
        bus: BusId,
    },
}

struct SubmixSendState {
    submix: SubmixId,
    level: Ramp,
}

struct BusSendState {
    bus: BusId,
    level: Ramp,
}

/// Render-side state of one playing source.
struct ActiveSource {
    id: SourceId,
    input: SourceInput,
    num_channels: usize,
    playing: bool,
    paused: bool,
    stopping: bool,
    done: bool,
    tails_done: bool,
    pending_release: bool,
    /// Produced audio this block; accumulation phases skip otherwise.
    rendered: bool,
    volume: Ramp,
    distance_attenuation: Ramp,
    pitch: Ramp,
    stop_gain: Ramp,
    lpf: OnePoleLpf,
    lpf_cutoff: Ramp,
    hpf: OnePoleHpf,
    hpf_cutoff: Ramp,
    effects: Vec<Box<dyn SourceEffect>>,
    play_effect_tails: bool,
    envelope: EnvelopeFollower,
    submix_sends: SmallVec<[SubmixSendState; 2]>,
    bus_sends: SmallVec<[BusSendState; 2]>,
    channel_maps: SmallVec<[(ChannelLayout, ChannelGainMap); 2]>,
    hrtf: bool,
    spat_params: SpatializationParams,
    spat_dirty: bool,
    /// Post-chain, post-attenuation block (what sends to submixes).
    post: Vec<Sample>,
    /// Post-volume, pre-attenuation block (what bus sends tap).
    pre_attenuation: Vec<Sample>,
    /// Stereo output of the object spatializer.
    hrtf_out: Vec<Sample>,
    frames_this_block: u64,
    loops_this_block: u32,
    underran: bool,
}

impl ActiveSource {
    fn should_render(&self) -> bool {
        !self.pending_release
            && self.playing
            && !self.paused
            && !(self.done && self.tails_done)
    }

    /// Full generation for a buffer-input source.
    fn generate(&mut self, ctx: GenContext) {
        if self.done {
            // Input over; keep the chain ringing tails on silence.
            self.post.fill(0.0);
        } else {
            let SourceInput::Buffer { buffer, cursor } = &mut self.input else {
                return;
            };
            let progress = cursor.run(buffer, &mut self.pitch, &mut self.post, ctx.hold_on_starve);
            self.frames_this_block = progress.source_frames;
            self.loops_this_block = buffer.take_loops();
            if progress.starved {
                self.underran = true;
            }
            if progress.finished {
                self.mark_input_finished();
            }
        }
        self.process_chain(ctx.block_frames);
        self.rendered = true;
    }

    /// Generation for a bus-input source, fed this block's bus mix.
    fn generate_from_bus(&mut self, bus_block: &[Sample], block_frames: usize) {
        if self.done {
            self.post.fill(0.0);
        } else {
            self.post.copy_from_slice(bus_block);
            self.frames_this_block = block_frames as u64;
        }
        self.process_chain(block_frames);
        self.rendered = true;
    }

    /// Effects, filters, volume, bus tap, attenuation and stop fade,
    /// envelope. Runs over the whole block in place on `post`.
    fn process_chain(&mut self, block_frames: usize) {
        let ch = self.num_channels;

        for effect in &mut self.effects {
            effect.process(&mut self.post, ch);
        }
        if self.done && !self.tails_done && self.effects.iter().all(|e| e.tails_done()) {
            self.tails_done = true;
        }

        for frame in 0..block_frames {
            let base = frame * ch;
            let frame_slice = &mut self.post[base..base + ch];
            if self.hpf_cutoff.is_ramping() {
                let cutoff = self.hpf_cutoff.next();
                self.hpf.set_cutoff(cutoff);
            }
            if !self.hpf.is_bypassed() {
                self.hpf.process_frame(frame_slice);
            }
            if self.lpf_cutoff.is_ramping() {
                let cutoff = self.lpf_cutoff.next();
                self.lpf.set_cutoff(cutoff);
            }
            if !self.lpf.is_bypassed() {
                self.lpf.process_frame(frame_slice);
            }
            let volume = self.volume.next();
            for sample in frame_slice {
                *sample *= volume;
            }
        }

        self.pre_attenuation.copy_from_slice(&self.post);

        for frame in 0..block_frames {
            let base = frame * ch;
            let gain = self.distance_attenuation.next() * self.stop_gain.next();
            for sample in &mut self.post[base..base + ch] {
                *sample *= gain;
            }
        }
        if self.stopping && !self.stop_gain.is_ramping() && self.stop_gain.value() <= 0.0 {
            self.finish_now();
        }

        self.envelope.process_interleaved(&self.post, ch);
    }

    fn mark_input_finished(&mut self) {
        self.done = true;
        if self.effects.is_empty() || !self.play_effect_tails {
            self.tails_done = true;
        }
    }

    /// Immediate stop: no more audio, tails cut.
    fn finish_now(&mut self) {
        self.done = true;
        self.tails_done = true;
        self.stopping = false;
        self.playing = false;
    }
}

struct SourceSlot {
    shared: Arc<SlotShared>,
    active: Option<ActiveSource>,
}

#[derive(Clone, Copy)]
struct GenContext {
    block_frames: usize,
    hold_on_starve: bool,
}

/// Per-slot generation, buffer-input sources only. Runs on the render
/// thread or a worker partition; touches nothing outside its slot.
fn generate_slot(slot: &mut SourceSlot, ctx: GenContext) {
    let Some(source) = slot.active.as_mut() else {
        return;
    };
    source.rendered = false;
    source.frames_this_block = 0;
    source.loops_this_block = 0;
    source.underran = false;
    if matches!(source.input, SourceInput::Bus { .. }) {
        return;
    }
    if !source.should_render() {
        return;
    }
    source.generate(ctx);
}

fn ensure_map(
    maps: &mut SmallVec<[(ChannelLayout, ChannelGainMap); 2]>,
    num_src: usize,
    layout: ChannelLayout,
) -> &mut ChannelGainMap {
    if let Some(pos) = maps.iter().position(|(l, _)| *l == layout) {
        return &mut maps[pos].1;
    }
    maps.push((layout, ChannelGainMap::default_for(num_src, layout)));
    let last = maps.len() - 1;
    &mut maps[last].1
}

/// Render-thread owner of the source slot pool.
pub struct SourceManager {
    shared: Arc<HandleShared>,
    config: EngineConfig,
    block_frames: usize,
    slots: Vec<SourceSlot>,
    submixes: Vec<Submix>,
    buses: Vec<BusInstance>,
    command_scratch: Vec<SourceCommand>,
    release_tx: rtrb::Producer<SourceId>,
    spatializer: Option<Box<dyn Spatializer>>,
    decode_pool: DecodePool,
    stats: Arc<EngineStats>,
    worker_pool: Option<rayon::ThreadPool>,
    /// Stereo maps the spatializer output mixes through, per layout.
    hrtf_maps: SmallVec<[(ChannelLayout, ChannelGainMap); 2]>,
}

impl SourceManager {
    /// Build the manager and its game-thread handle. The device submix is
    /// registered up front with the configured layout.
    pub fn new(
        config: EngineConfig,
        spatializer: Option<Box<dyn Spatializer>>,
    ) -> OndaResult<(Self, SourceManagerHandle)> {
        config.validate()?;

        let block_frames = config.block_size.as_usize();
        let num_sources = config.num_sources;

        let slot_shared: Vec<Arc<SlotShared>> =
            (0..num_sources).map(|_| Arc::new(SlotShared::new())).collect();
        let slots: Vec<SourceSlot> = slot_shared
            .iter()
            .map(|shared| SourceSlot {
                shared: Arc::clone(shared),
                active: None,
            })
            .collect();
        // Popped from the back; lowest ids hand out first.
        let free_ids: Vec<SourceId> = (0..num_sources as u32).rev().map(SourceId).collect();

        let (release_tx, release_rx) = rtrb::RingBuffer::new(num_sources);
        let decode_pool = DecodePool::new(config.effective_decode_workers());
        let stats = Arc::new(EngineStats::default());
        let hrtf_available = spatializer.is_some() && !config.disable_hrtf;

        let worker_pool = if config.num_source_workers >= 2 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_source_workers)
                .thread_name(|i| format!("onda-source-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    log::error!("Failed to build source worker pool: {e}. Rendering serially.");
                    None
                }
            }
        } else {
            None
        };

        let shared = Arc::new(HandleShared {
            commands: CommandQueue::new(),
            slots: slot_shared,
            free_ids: Mutex::new(free_ids),
            release_acks: Mutex::new(release_rx),
            scheduler: decode_pool.scheduler(),
            stats: Arc::clone(&stats),
            config: config.clone(),
            submix_layouts: RwLock::new(HashMap::new()),
            bus_channels: RwLock::new(HashMap::new()),
            hrtf_available,
        });
        let handle = SourceManagerHandle {
            shared: Arc::clone(&shared),
        };

        let mut manager = Self {
            shared,
            block_frames,
            slots,
            submixes: Vec::new(),
            buses: Vec::new(),
            command_scratch: Vec::new(),
            release_tx,
            spatializer,
            decode_pool,
            stats,
            worker_pool,
            hrtf_maps: SmallVec::new(),
            config,
        };
        manager.submixes.push(Submix::new(
            DEVICE_SUBMIX,
            manager.config.device_layout,
            block_frames,
        ));
        manager
            .shared
            .submix_layouts
            .write()
            .insert(DEVICE_SUBMIX, manager.config.device_layout);

        log::info!(
            "Source manager: {} slots, {} frame blocks at {} Hz, {} decode workers",
            num_sources,
            block_frames,
            manager.config.sample_rate.as_u32(),
            manager.decode_pool.num_workers(),
        );

        Ok((manager, handle))
    }

    pub fn handle(&self) -> SourceManagerHandle {
        SourceManagerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Render one block into the submix buffers.
    pub fn render_block(&mut self) {
        self.process_commands();
        self.update_buffers();
        self.process_pending_releases();

        for submix in &mut self.submixes {
            submix.clear();
        }
        for bus in &mut self.buses {
            bus.clear();
        }

        self.generate_sources();
        self.process_spatializer();
        self.accumulate_bus_sends();
        self.generate_bus_sources();
        self.accumulate_submix_sends();
        self.publish();
    }

    /// Mixed output of a submix for the block rendered last.
    pub fn submix_buffer(&self, submix: SubmixId) -> Option<&[Sample]> {
        self.submixes
            .iter()
            .find(|s| s.id == submix)
            .map(|s| s.buffer.as_slice())
    }

    /// Device-facing submix output.
    pub fn device_buffer(&self) -> &[Sample] {
        self.submixes
            .first()
            .map(|s| s.buffer.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_active_sources(&self) -> usize {
        self.slots.iter().filter(|s| s.active.is_some()).count()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn process_commands(&mut self) {
        let mut commands = std::mem::take(&mut self.command_scratch);
        let count = self.shared.commands.drain(&mut commands);
        for command in commands.drain(..) {
            self.apply_command(command);
        }
        self.command_scratch = commands;
        if count > 0 {
            self.stats
                .commands_processed
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    fn apply_command(&mut self, command: SourceCommand) {
        let block = self.block_frames as u32;
        match command {
            SourceCommand::Init { id, init } => self.init_slot(id, *init),
            SourceCommand::Play { id } => self.with_source(id, |s| {
                s.playing = true;
                s.paused = false;
            }),
            SourceCommand::Pause { id } => self.with_source(id, |s| s.paused = true),
            SourceCommand::Stop { id } => self.with_source(id, |s| s.finish_now()),
            SourceCommand::StopFade { id, fade_frames } => self.with_source(id, |s| {
                if !s.stopping && !s.done {
                    s.stopping = true;
                    s.stop_gain.set_target(0.0, fade_frames);
                }
            }),
            SourceCommand::Release { id } => self.apply_release(id),
            SourceCommand::SetVolume { id, volume } => {
                self.with_source(id, |s| s.volume.set_target(volume, block));
            }
            SourceCommand::SetDistanceAttenuation { id, gain } => {
                self.with_source(id, |s| s.distance_attenuation.set_target(gain, block));
            }
            SourceCommand::SetPitch { id, pitch } => self.with_source(id, |s| {
                if matches!(s.input, SourceInput::Buffer { .. }) {
                    s.pitch.set_target(pitch, block);
                }
            }),
            SourceCommand::SetLpfFrequency { id, frequency } => {
                self.with_source(id, |s| s.lpf_cutoff.set_target(frequency, block));
            }
            SourceCommand::SetHpfFrequency { id, frequency } => {
                self.with_source(id, |s| s.hpf_cutoff.set_target(frequency, block));
            }
            SourceCommand::SetChannelMap { id, map } => self.apply_channel_map(id, map),
            SourceCommand::SetSubmixSend { id, submix, level } => {
                self.apply_submix_send(id, submix, level);
            }
            SourceCommand::SetBusSend { id, bus, level } => self.apply_bus_send(id, bus, level),
            SourceCommand::SetSpatializationParams { id, params } => self.with_source(id, |s| {
                s.spat_params = params;
                s.spat_dirty = true;
            }),
            SourceCommand::RegisterSubmix { submix, layout } => {
                if !self.submixes.iter().any(|s| s.id == submix) {
                    self.submixes
                        .push(Submix::new(submix, layout, self.block_frames));
                }
            }
            SourceCommand::RegisterBus { bus, num_channels } => {
                if !self.buses.iter().any(|b| b.id == bus) {
                    self.buses
                        .push(BusInstance::new(bus, num_channels, self.block_frames));
                }
            }
        }
    }

    fn with_source(&mut self, id: SourceId, f: impl FnOnce(&mut ActiveSource)) {
        match self.slots.get_mut(id.index()).and_then(|s| s.active.as_mut()) {
            Some(source) => f(source),
            None => log::trace!("Command for source {id} with no active slot"),
        }
    }

    fn init_slot(&mut self, id: SourceId, init: InitCommand) {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            log::error!("Init for out-of-range source {id}");
            return;
        };
        if slot.active.is_some() {
            log::error!("Init for source {id} which is already active");
            return;
        }

        let InitCommand {
            args,
            hrtf,
            num_channels,
        } = init;
        let block = self.block_frames;
        let sample_rate = self.config.sample_rate.as_f32();

        let input = match (args.buffer, args.bus_input) {
            (Some(buffer), _) => SourceInput::Buffer {
                buffer,
                cursor: FrameCursor::new(),
            },
            (None, Some(bus)) => SourceInput::Bus { bus },
            (None, None) => {
                log::error!("Init for source {id} carried no input");
                return;
            }
        };

        let mut lpf = OnePoleLpf::new(sample_rate, num_channels);
        lpf.set_cutoff(args.lpf_frequency);
        let mut hpf = OnePoleHpf::new(sample_rate, num_channels);
        hpf.set_cutoff(args.hpf_frequency);

        let mut channel_maps: SmallVec<[(ChannelLayout, ChannelGainMap); 2]> = SmallVec::new();
        for map in &args.channel_maps {
            let mut gain_map = ChannelGainMap::new(num_channels, map.layout.num_channels());
            gain_map.snap(&map.gains);
            channel_maps.push((map.layout, gain_map));
        }
        for send in &args.submix_sends {
            if let Some(submix) = self.submixes.iter().find(|s| s.id == send.submix) {
                if hrtf {
                    ensure_map(&mut self.hrtf_maps, 2, submix.layout);
                } else {
                    ensure_map(&mut channel_maps, num_channels, submix.layout);
                }
            }
        }

        let submix_sends = args
            .submix_sends
            .iter()
            .map(|p| SubmixSendState {
                submix: p.submix,
                level: Ramp::new(p.level),
            })
            .collect();
        let bus_sends = args
            .bus_sends
            .iter()
            .map(|p| BusSendState {
                bus: p.bus,
                level: Ramp::new(p.level),
            })
            .collect();

        slot.active = Some(ActiveSource {
            id,
            input,
            num_channels,
            playing: false,
            paused: false,
            stopping: false,
            done: false,
            tails_done: false,
            pending_release: false,
            rendered: false,
            volume: Ramp::new(args.volume),
            distance_attenuation: Ramp::new(args.distance_attenuation),
            pitch: Ramp::new(args.pitch),
            stop_gain: Ramp::new(1.0),
            lpf,
            lpf_cutoff: Ramp::new(args.lpf_frequency),
            hpf,
            hpf_cutoff: Ramp::new(args.hpf_frequency),
            effects: args.effects,
            play_effect_tails: args.play_effect_tails,
            envelope: EnvelopeFollower::new(
                sample_rate,
                self.config.envelope_attack_ms,
                self.config.envelope_release_ms,
            ),
            submix_sends,
            bus_sends,
            channel_maps,
            hrtf,
            spat_params: args.spatialization,
            spat_dirty: hrtf,
            post: vec![0.0; block * num_channels],
            pre_attenuation: vec![0.0; block * num_channels],
            hrtf_out: if hrtf { vec![0.0; block * 2] } else { Vec::new() },
            frames_this_block: 0,
            loops_this_block: 0,
            underran: false,
        });
    }

    fn apply_release(&mut self, id: SourceId) {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return;
        };
        match slot.active.as_mut() {
            Some(source) => source.pending_release = true,
            None => {
                // Claimed but never initialized; free it straight away.
                slot.shared.busy.store(false, Ordering::Release);
                if self.release_tx.push(id).is_err() {
                    log::error!("Release ack ring full; source {id} leaked");
                }
            }
        }
    }

    fn apply_channel_map(&mut self, id: SourceId, map: ChannelMapParam) {
        let Some(source) = self.slots.get_mut(id.index()).and_then(|s| s.active.as_mut())
        else {
            return;
        };
        if source.hrtf {
            // Spatialized sources route through the shared post-HRTF maps.
            log::debug!("Channel map ignored for object-spatialized source {id}");
            return;
        }
        let expected = source.num_channels * map.layout.num_channels();
        if map.gains.len() != expected {
            log::warn!(
                "Channel map for source {id} has {} gains, expected {expected}",
                map.gains.len()
            );
            return;
        }
        ensure_map(&mut source.channel_maps, source.num_channels, map.layout)
            .set_target(&map.gains);
    }

    fn apply_submix_send(&mut self, id: SourceId, submix: SubmixId, level: f32) {
        let block = self.block_frames as u32;
        let Some(source) = self.slots.get_mut(id.index()).and_then(|s| s.active.as_mut())
        else {
            return;
        };
        let Some(layout) = self
            .submixes
            .iter()
            .find(|s| s.id == submix)
            .map(|s| s.layout)
        else {
            log::debug!("Send from source {id} to unregistered submix {submix}");
            return;
        };

        if source.hrtf {
            ensure_map(&mut self.hrtf_maps, 2, layout);
        } else {
            ensure_map(&mut source.channel_maps, source.num_channels, layout);
        }
        match source.submix_sends.iter_mut().find(|s| s.submix == submix) {
            Some(send) => send.level.set_target(level, block),
            None => {
                let mut ramp = Ramp::new(0.0);
                ramp.set_target(level, block);
                source.submix_sends.push(SubmixSendState {
                    submix,
                    level: ramp,
                });
            }
        }
    }

    fn apply_bus_send(&mut self, id: SourceId, bus: BusId, level: f32) {
        let block = self.block_frames as u32;
        let Some(source) = self.slots.get_mut(id.index()).and_then(|s| s.active.as_mut())
        else {
            return;
        };
        if matches!(source.input, SourceInput::Bus { .. }) {
            log::warn!("Bus-input source {id} cannot send to buses");
            return;
        }
        if !self.buses.iter().any(|b| b.id == bus) {
            log::debug!("Send from source {id} to unregistered bus {bus}");
            return;
        }
        match source.bus_sends.iter_mut().find(|s| s.bus == bus) {
            Some(send) => send.level.set_target(level, block),
            None => {
                let mut ramp = Ramp::new(0.0);
                ramp.set_target(level, block);
                source.bus_sends.push(BusSendState { bus, level: ramp });
            }
        }
    }

    fn update_buffers(&mut self) {
        for slot in &mut self.slots {
            if let Some(source) = &mut slot.active {
                if let SourceInput::Buffer { buffer, .. } = &mut source.input {
                    buffer.update();
                }
            }
        }
    }

    /// Tear down released slots whose decode task has come home.
    fn process_pending_releases(&mut self) {
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            if !source.pending_release {
                continue;
            }
            let task_done = match &source.input {
                SourceInput::Buffer { buffer, .. } => buffer.is_async_task_done(),
                SourceInput::Bus { .. } => true,
            };
            if !task_done {
                continue;
            }
            let id = source.id;
            let was_hrtf = source.hrtf;
            slot.active = None;
            if was_hrtf {
                if let Some(spatializer) = &mut self.spatializer {
                    spatializer.on_release(id);
                }
            }
            slot.shared.busy.store(false, Ordering::Release);
            if self.release_tx.push(id).is_err() {
                log::error!("Release ack ring full; source {id} leaked");
            }
        }
    }

    fn generate_sources(&mut self) {
        let ctx = GenContext {
            block_frames: self.block_frames,
            hold_on_starve: matches!(self.config.underrun_mode, UnderrunMode::HoldLastFrame),
        };
        match &self.worker_pool {
            Some(pool) => {
                let partition = self
                    .slots
                    .len()
                    .div_ceil(self.config.num_source_workers)
                    .max(1);
                let slots = &mut self.slots;
                pool.install(|| {
                    slots.par_chunks_mut(partition).for_each(|chunk| {
                        for slot in chunk {
                            generate_slot(slot, ctx);
                        }
                    });
                });
            }
            None => {
                for slot in &mut self.slots {
                    generate_slot(slot, ctx);
                }
            }
        }
    }

    /// Serial pass handing mono blocks to the object spatializer.
    fn process_spatializer(&mut self) {
        let Some(spatializer) = &mut self.spatializer else {
            return;
        };
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            if !source.hrtf || !source.rendered {
                continue;
            }
            if source.spat_dirty {
                spatializer.set_params(source.id, &source.spat_params);
                source.spat_dirty = false;
            }
            spatializer.process(source.id, &source.post, &mut source.hrtf_out);
        }
    }

    /// Sum pre-attenuation taps into bus buffers so bus-input sources can
    /// consume them later this same block.
    fn accumulate_bus_sends(&mut self) {
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            if !source.rendered
                || source.bus_sends.is_empty()
                || matches!(source.input, SourceInput::Bus { .. })
            {
                continue;
            }
            for send in &mut source.bus_sends {
                let Some(bus) = self.buses.iter_mut().find(|b| b.id == send.bus) else {
                    continue;
                };
                mix_fold(
                    &source.pre_attenuation,
                    source.num_channels,
                    &mut bus.buffer,
                    bus.num_channels,
                    &mut send.level,
                );
            }
        }
    }

    fn generate_bus_sources(&mut self) {
        let block = self.block_frames;
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            let SourceInput::Bus { bus } = source.input else {
                continue;
            };
            if !source.should_render() {
                continue;
            }
            match self.buses.iter().find(|b| b.id == bus) {
                Some(bus_instance) => source.generate_from_bus(&bus_instance.buffer, block),
                None => {
                    // Bus vanished from under the source; render silence.
                    source.post.fill(0.0);
                    source.process_chain(block);
                    source.rendered = true;
                }
            }
        }
    }

    /// Mix every rendered source into its submix sends through the per-pair
    /// gain maps, ramping send levels and crossfading maps over the block.
    fn accumulate_submix_sends(&mut self) {
        let block = self.block_frames;
        let inv_block = 1.0 / block as f32;
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            if !source.rendered {
                continue;
            }

            let (src_block, src_ch, maps) = if source.hrtf {
                (source.hrtf_out.as_slice(), 2, &mut self.hrtf_maps)
            } else {
                (
                    source.post.as_slice(),
                    source.num_channels,
                    &mut source.channel_maps,
                )
            };

            for send in &mut source.submix_sends {
                let Some(submix) = self.submixes.iter_mut().find(|s| s.id == send.submix)
                else {
                    continue;
                };
                let dst_ch = submix.num_channels();
                let map = ensure_map(maps, src_ch, submix.layout);
                for frame in 0..block {
                    let level = send.level.next();
                    let alpha = frame as f32 * inv_block;
                    let sbase = frame * src_ch;
                    let dbase = frame * dst_ch;
                    for s in 0..src_ch {
                        let sample = src_block[sbase + s] * level;
                        for d in 0..dst_ch {
                            submix.buffer[dbase + d] += sample * map.gain(s, d, alpha);
                        }
                    }
                }
            }
            for (_, map) in maps.iter_mut() {
                map.finish_block();
            }
        }
    }

    /// Snapshot per-slot state and engine counters for the game thread.
    fn publish(&mut self) {
        let mut active = 0usize;
        let mut underruns = 0u64;
        for slot in &mut self.slots {
            let Some(source) = slot.active.as_mut() else {
                continue;
            };
            active += 1;
            if source.frames_this_block > 0 {
                slot.shared
                    .frames_played
                    .fetch_add(source.frames_this_block, Ordering::Relaxed);
            }
            if source.loops_this_block > 0 {
                slot.shared
                    .loop_count
                    .fetch_add(source.loops_this_block, Ordering::Relaxed);
            }
            slot.shared
                .envelope
                .store(source.envelope.value().to_bits(), Ordering::Relaxed);
            if source.done {
                slot.shared.done.store(true, Ordering::Release);
            }
            if source.tails_done {
                slot.shared.effect_tails_done.store(true, Ordering::Release);
            }
            if source.underran {
                underruns += 1;
            }
        }
        self.stats.active_sources.store(active, Ordering::Relaxed);
        if underruns > 0 {
            self.stats.underruns.fetch_add(underruns, Ordering::Relaxed);
        }
        self.stats.blocks_rendered.fetch_add(1, Ordering::Relaxed);
    }
}
