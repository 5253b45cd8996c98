//! Per-source command surface with change deduplication.

use onda_core::{BusId, ChannelLayout, Sample, SourceId, SubmixId};
use smallvec::SmallVec;

use crate::{SourceInitArgs, SourceManagerHandle, SpatializationParams};

/// Live handle to one initialized source slot.
///
/// Setters cache the last submitted value and skip commands that would not
/// change anything, so per-tick callers can set unconditionally without
/// flooding the queue. The slot is released when the voice drops; teardown
/// completes render-side and the id returns to the pool through the
/// acknowledge ring.
pub struct SourceVoice {
    handle: SourceManagerHandle,
    id: SourceId,
    volume: f32,
    distance_attenuation: f32,
    pitch: f32,
    lpf_frequency: f32,
    hpf_frequency: f32,
    submix_levels: SmallVec<[(SubmixId, f32); 2]>,
    bus_levels: SmallVec<[(BusId, f32); 2]>,
    playing: bool,
    paused: bool,
    stopping: bool,
}

impl SourceVoice {
    /// Wrap an id that [`SourceManagerHandle::init_source`] accepted,
    /// seeding the dedupe caches from the init parameters.
    pub fn new(handle: SourceManagerHandle, id: SourceId, args: &SourceInitArgs) -> Self {
        Self {
            handle,
            id,
            volume: args.volume,
            distance_attenuation: args.distance_attenuation,
            pitch: args.pitch,
            lpf_frequency: args.lpf_frequency,
            hpf_frequency: args.hpf_frequency,
            submix_levels: args
                .submix_sends
                .iter()
                .map(|s| (s.submix, s.level))
                .collect(),
            bus_levels: args.bus_sends.iter().map(|s| (s.bus, s.level)).collect(),
            playing: false,
            paused: false,
            stopping: false,
        }
    }

    #[inline]
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn play(&mut self) {
        if self.playing && !self.paused {
            return;
        }
        self.playing = true;
        self.paused = false;
        self.handle.play(self.id);
    }

    pub fn pause(&mut self) {
        if !self.playing || self.paused {
            return;
        }
        self.paused = true;
        self.handle.pause(self.id);
    }

    /// Immediate stop. Audio cuts at the next block edge, effect tails
    /// included.
    pub fn stop(&mut self) {
        self.playing = false;
        self.paused = false;
        self.stopping = false;
        self.handle.stop(self.id);
    }

    /// Stop behind a fade; `None` uses the configured default length.
    pub fn stop_with_fade(&mut self, fade_frames: Option<u32>) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.handle.stop_with_fade(self.id, fade_frames);
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_volume(&mut self, volume: f32) {
        if volume == self.volume {
            return;
        }
        self.volume = volume;
        self.handle.set_volume(self.id, volume);
    }

    pub fn set_distance_attenuation(&mut self, gain: f32) {
        if gain == self.distance_attenuation {
            return;
        }
        self.distance_attenuation = gain;
        self.handle.set_distance_attenuation(self.id, gain);
    }

    pub fn set_pitch(&mut self, pitch: f32) {
        if pitch == self.pitch {
            return;
        }
        self.pitch = pitch;
        self.handle.set_pitch(self.id, pitch);
    }

    pub fn set_lpf_frequency(&mut self, frequency: f32) {
        if frequency == self.lpf_frequency {
            return;
        }
        self.lpf_frequency = frequency;
        self.handle.set_lpf_frequency(self.id, frequency);
    }

    pub fn set_hpf_frequency(&mut self, frequency: f32) {
        if frequency == self.hpf_frequency {
            return;
        }
        self.hpf_frequency = frequency;
        self.handle.set_hpf_frequency(self.id, frequency);
    }

    pub fn set_submix_send(&mut self, submix: SubmixId, level: f32) {
        match self.submix_levels.iter_mut().find(|(s, _)| *s == submix) {
            Some((_, cached)) if *cached == level => return,
            Some((_, cached)) => *cached = level,
            None => self.submix_levels.push((submix, level)),
        }
        self.handle.set_submix_send(self.id, submix, level);
    }

    pub fn set_bus_send(&mut self, bus: BusId, level: f32) {
        match self.bus_levels.iter_mut().find(|(b, _)| *b == bus) {
            Some((_, cached)) if *cached == level => return,
            Some((_, cached)) => *cached = level,
            None => self.bus_levels.push((bus, level)),
        }
        self.handle.set_bus_send(self.id, bus, level);
    }

    /// Not deduplicated; callers resubmit maps only when geometry moves.
    pub fn set_channel_map(&self, layout: ChannelLayout, gains: &[Sample]) {
        self.handle.set_channel_map(self.id, layout, gains);
    }

    pub fn set_spatialization_params(&self, params: SpatializationParams) {
        self.handle.set_spatialization_params(self.id, params);
    }

    /// The input ran out or the source was stopped.
    pub fn is_done(&self) -> bool {
        self.handle.is_done(self.id)
    }

    pub fn is_effect_tails_done(&self) -> bool {
        self.handle.is_effect_tails_done(self.id)
    }

    /// Fully finished: input over and any effect tails rung out.
    pub fn is_finished(&self) -> bool {
        self.is_done() && self.is_effect_tails_done()
    }

    /// Source frames consumed since init.
    pub fn frames_played(&self) -> u64 {
        self.handle.frames_played(self.id)
    }

    /// Post-attenuation envelope of the last rendered block.
    pub fn envelope_value(&self) -> f32 {
        self.handle.envelope_value(self.id)
    }

    /// Loop wraps consumed since init.
    pub fn loop_count(&self) -> u32 {
        self.handle.loop_count(self.id)
    }

    /// True once after a speaker geometry change; the owner recomputes and
    /// resubmits its channel maps.
    pub fn take_needs_speaker_map(&self) -> bool {
        self.handle.take_needs_speaker_map(self.id)
    }

    /// Release the slot. Dropping the voice does the same.
    pub fn release(self) {}
}

impl Drop for SourceVoice {
    fn drop(&mut self) {
        self.handle.release_source(self.id);
    }
}
