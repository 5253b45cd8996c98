//! Per-source decoded audio buffering.
//!
//! Each playing source owns a [`SourceBuffer`]: a short ring of decoded
//! chunks topped up through the decode pool, with at most one decode task
//! outstanding at any time. The render thread consumes frames through a
//! [`FrameCursor`], which linearly interpolates between adjacent source
//! frames so pitch (and sample-rate conversion folded into pitch) falls out
//! of the same read path.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use onda_core::{MAX_CHANNELS, Sample};
use onda_dsp::Ramp;

use crate::{
    DecodeJob, DecodeResult, DecodeScheduler, LoopingMode, ProceduralHandle, RawPcmReader,
    SourceError, WaveFormat, WaveReader, WaveSource,
};

/// Decoded chunks a source keeps ahead of the read cursor.
pub const MAX_BUFFERS_QUEUED: usize = 3;

enum ChunkPayload {
    /// Decoded into a recyclable heap chunk.
    Owned(Vec<Sample>),
    /// Pre-decoded first chunk shared with the asset system.
    Shared(Arc<[Sample]>),
}

/// One decoded chunk of interleaved audio.
pub(crate) struct DecodedChunk {
    payload: ChunkPayload,
    frames: usize,
    looped: bool,
}

impl DecodedChunk {
    #[inline]
    pub(crate) fn samples(&self) -> &[Sample] {
        match &self.payload {
            ChunkPayload::Owned(v) => v,
            ChunkPayload::Shared(s) => s,
        }
    }

    #[inline]
    pub(crate) fn frames(&self) -> usize {
        self.frames
    }
}

/// Chunk ring between the decode pool and one source's read cursor.
///
/// Created game-side (so decode warm-up overlaps the rest of the tick) and
/// moved to the render thread inside the init command. Raw PCM decodes its
/// first two chunks synchronously at creation; a streaming source with a
/// cached first chunk starts from that and seeks its decoder past it.
pub struct SourceBuffer {
    format: WaveFormat,
    looping: LoopingMode,
    ready: VecDeque<DecodedChunk>,
    free_chunks: Vec<Vec<Sample>>,
    reader: Option<WaveReader>,
    task_in_flight: bool,
    finished_decoding: bool,
    chunk_samples: usize,
    scheduler: DecodeScheduler,
    reply_tx: Sender<DecodeResult>,
    reply_rx: Receiver<DecodeResult>,
    loops_pending: u32,
    procedural: Option<ProceduralHandle>,
}

impl SourceBuffer {
    pub fn new(
        source: WaveSource,
        looping: LoopingMode,
        chunk_frames: usize,
        scheduler: DecodeScheduler,
    ) -> Result<Self, SourceError> {
        let format = source.format();
        if format.num_channels == 0 || format.num_channels > MAX_CHANNELS {
            return Err(SourceError::InvalidFormat(format!(
                "unsupported channel count {}",
                format.num_channels
            )));
        }
        if format.sample_rate == 0 {
            return Err(SourceError::InvalidFormat("zero sample rate".into()));
        }

        let (reply_tx, reply_rx) = DecodeScheduler::reply_channel();
        let mut buffer = Self {
            format,
            looping,
            ready: VecDeque::with_capacity(MAX_BUFFERS_QUEUED),
            free_chunks: Vec::new(),
            reader: None,
            task_in_flight: false,
            finished_decoding: false,
            chunk_samples: chunk_frames * format.num_channels,
            scheduler,
            reply_tx,
            reply_rx,
            loops_pending: 0,
            procedural: None,
        };

        match source {
            WaveSource::RawPcm { data } => {
                buffer.reader = Some(WaveReader::RawPcm(RawPcmReader::new(data, 0)));
                // Resident PCM is a memcpy; decode two chunks up front so
                // playback can start this tick.
                buffer.decode_inline();
                buffer.decode_inline();
            }
            WaveSource::Streaming {
                mut decoder,
                cached_first_chunk,
            } => {
                if let Some(cached) = cached_first_chunk {
                    if cached.len() % format.num_channels != 0 {
                        return Err(SourceError::InvalidFormat(
                            "cached first chunk not frame aligned".into(),
                        ));
                    }
                    if !cached.is_empty() {
                        let frames = cached.len() / format.num_channels;
                        decoder.seek_to_frame(frames as u64);
                        buffer.ready.push_back(DecodedChunk {
                            payload: ChunkPayload::Shared(cached),
                            frames,
                            looped: false,
                        });
                    }
                }
                buffer.reader = Some(WaveReader::Streaming {
                    decoder,
                    num_channels: format.num_channels,
                });
            }
            WaveSource::Procedural { handle } => {
                if !handle.try_claim() {
                    return Err(SourceError::AlreadyGenerating);
                }
                buffer.reader = Some(WaveReader::Procedural {
                    handle: handle.clone(),
                    num_channels: format.num_channels,
                });
                buffer.procedural = Some(handle);
            }
        }

        buffer.kick();
        Ok(buffer)
    }

    /// Collect finished decodes and keep the ring topped up. Called once per
    /// render block, and game-side while waiting to init.
    pub fn update(&mut self) {
        self.poll_replies();
        self.kick();
    }

    fn poll_replies(&mut self) {
        while let Ok(result) = self.reply_rx.try_recv() {
            self.absorb_result(result);
        }
    }

    fn absorb_result(&mut self, result: DecodeResult) {
        self.task_in_flight = false;
        self.reader = Some(result.reader);
        if result.progress.finished {
            self.finished_decoding = true;
        }
        if result.progress.frames_written > 0 {
            self.ready.push_back(DecodedChunk {
                payload: ChunkPayload::Owned(result.chunk),
                frames: result.progress.frames_written,
                looped: result.progress.looped,
            });
        } else {
            self.free_chunks.push(result.chunk);
        }
    }

    /// Submit the next decode task if the ring has room and none is out.
    fn kick(&mut self) {
        if self.task_in_flight
            || self.finished_decoding
            || self.ready.len() >= MAX_BUFFERS_QUEUED
        {
            return;
        }
        let Some(reader) = self.reader.take() else {
            return;
        };
        let chunk = self.take_chunk();
        self.task_in_flight = true;
        self.scheduler.submit(DecodeJob {
            reader,
            chunk,
            looping: self.looping,
            reply: self.reply_tx.clone(),
        });
    }

    /// Run one decode on the calling thread.
    fn decode_inline(&mut self) {
        if self.finished_decoding {
            return;
        }
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let mut chunk = self.take_chunk();
        let progress = reader.run(&mut chunk, self.looping);
        self.reader = Some(reader);
        if progress.finished {
            self.finished_decoding = true;
        }
        if progress.frames_written > 0 {
            self.ready.push_back(DecodedChunk {
                payload: ChunkPayload::Owned(chunk),
                frames: progress.frames_written,
                looped: progress.looped,
            });
        } else {
            self.free_chunks.push(chunk);
        }
    }

    fn take_chunk(&mut self) -> Vec<Sample> {
        match self.free_chunks.pop() {
            Some(mut chunk) => {
                chunk.resize(self.chunk_samples, 0.0);
                chunk
            }
            None => vec![0.0; self.chunk_samples],
        }
    }

    pub(crate) fn front_chunk(&self) -> Option<&DecodedChunk> {
        self.ready.front()
    }

    /// Retire the front chunk, recycling its storage and rolling any loop
    /// wrap it carried into the pending loop count.
    pub(crate) fn pop_front_chunk(&mut self) {
        if let Some(chunk) = self.ready.pop_front() {
            if chunk.looped {
                self.loops_pending += 1;
            }
            if let ChunkPayload::Owned(v) = chunk.payload {
                self.free_chunks.push(v);
            }
            self.kick();
        }
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.format.num_channels
    }

    #[inline]
    pub fn format(&self) -> WaveFormat {
        self.format
    }

    #[inline]
    pub fn looping(&self) -> LoopingMode {
        self.looping
    }

    pub fn num_chunks_queued(&self) -> usize {
        self.ready.len()
    }

    pub fn frames_queued(&self) -> usize {
        self.ready.iter().map(|c| c.frames).sum()
    }

    /// Decoded audio is ready to play right now.
    pub fn has_audio_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// No decode task is out; the buffer can be dropped without a worker
    /// still writing into it.
    pub fn is_async_task_done(&self) -> bool {
        !self.task_in_flight
    }

    /// A decode task is out on the worker pool.
    pub fn is_async_task_in_progress(&self) -> bool {
        self.task_in_flight
    }

    /// Block until the outstanding decode task replies, absorbing its
    /// result. Every submitted job runs and replies, so the wait is bounded
    /// by one chunk decode. Render-side code polls `is_async_task_done` and
    /// defers instead of calling this.
    pub fn ensure_async_task_finishes(&mut self) {
        if !self.task_in_flight {
            return;
        }
        match self.reply_rx.recv() {
            Ok(result) => self.absorb_result(result),
            Err(_) => self.task_in_flight = false,
        }
    }

    pub fn is_finished_decoding(&self) -> bool {
        self.finished_decoding
    }

    /// The input produced everything it ever will and it was all consumed.
    pub fn is_exhausted(&self) -> bool {
        self.finished_decoding && self.ready.is_empty()
    }

    /// Loop wraps consumed by playback since the last call.
    pub fn take_loops(&mut self) -> u32 {
        std::mem::take(&mut self.loops_pending)
    }
}

impl Drop for SourceBuffer {
    fn drop(&mut self) {
        // A dropped buffer's in-flight job owns its reader and chunk; the
        // failed reply send drops them on the worker. Procedural inputs
        // wait for the reply first so the claim is released only once the
        // generator is idle.
        if self.procedural.is_some() {
            self.ensure_async_task_finishes();
        }
        if let Some(handle) = &self.procedural {
            handle.release_claim();
        }
    }
}

/// Outcome of one cursor pass over a render block.
pub(crate) struct CursorProgress {
    pub frames_filled: usize,
    /// Source frames consumed (the `frames_played` unit).
    pub source_frames: u64,
    /// Ran out of decoded audio before the input actually ended.
    pub starved: bool,
    /// The input is fully consumed.
    pub finished: bool,
}

/// Linear-interpolating read cursor over a source buffer.
///
/// Keeps the two source frames bracketing the read position; `alpha`
/// advances by the per-frame pitch and every whole step pulls the next
/// source frame, crossing chunk seams transparently.
pub(crate) struct FrameCursor {
    current: [Sample; MAX_CHANNELS],
    next: [Sample; MAX_CHANNELS],
    alpha: f32,
    read_frame: usize,
    primed: bool,
    /// The final source frame is in `current`; interpolate it to silence.
    drained: bool,
}

impl FrameCursor {
    pub(crate) fn new() -> Self {
        Self {
            current: [0.0; MAX_CHANNELS],
            next: [0.0; MAX_CHANNELS],
            alpha: 0.0,
            read_frame: 0,
            primed: false,
            drained: false,
        }
    }

    /// Pull one source frame into `current` or `next`.
    fn pull(&mut self, buffer: &mut SourceBuffer, into_next: bool) -> bool {
        let ch = buffer.num_channels();
        loop {
            let Some(chunk) = buffer.front_chunk() else {
                return false;
            };
            if self.read_frame >= chunk.frames() {
                buffer.pop_front_chunk();
                self.read_frame = 0;
                continue;
            }
            let base = self.read_frame * ch;
            let frame = &chunk.samples()[base..base + ch];
            if into_next {
                self.next[..ch].copy_from_slice(frame);
            } else {
                self.current[..ch].copy_from_slice(frame);
            }
            self.read_frame += 1;
            return true;
        }
    }

    /// Fill `out` (interleaved at the buffer's channel count), advancing the
    /// read position by the ramped pitch each output frame.
    pub(crate) fn run(
        &mut self,
        buffer: &mut SourceBuffer,
        pitch: &mut Ramp,
        out: &mut [Sample],
        hold_on_starve: bool,
    ) -> CursorProgress {
        let ch = buffer.num_channels();
        let out_frames = out.len() / ch;
        let mut progress = CursorProgress {
            frames_filled: 0,
            source_frames: 0,
            starved: false,
            finished: false,
        };

        if !self.primed {
            if !self.pull(buffer, false) {
                out.fill(0.0);
                if buffer.is_exhausted() {
                    progress.finished = true;
                } else {
                    progress.starved = true;
                }
                return progress;
            }
            progress.source_frames += 1;
            if self.pull(buffer, true) {
                progress.source_frames += 1;
            } else {
                self.next = self.current;
            }
            self.alpha = 0.0;
            self.primed = true;
        }

        for frame in 0..out_frames {
            let base = frame * ch;
            for c in 0..ch {
                out[base + c] = self.current[c] + (self.next[c] - self.current[c]) * self.alpha;
            }
            progress.frames_filled += 1;

            self.alpha += pitch.next();
            while self.alpha >= 1.0 {
                self.alpha -= 1.0;
                self.current = self.next;
                if self.pull(buffer, true) {
                    progress.source_frames += 1;
                } else if buffer.is_exhausted() {
                    if self.drained {
                        progress.finished = true;
                        out[(frame + 1) * ch..].fill(0.0);
                        return progress;
                    }
                    self.drained = true;
                    self.next = [0.0; MAX_CHANNELS];
                    break;
                } else {
                    progress.starved = true;
                    if hold_on_starve {
                        self.alpha = 0.0;
                        let held = self.current;
                        for f in frame + 1..out_frames {
                            let b = f * ch;
                            out[b..b + ch].copy_from_slice(&held[..ch]);
                        }
                        progress.frames_filled = out_frames;
                    } else {
                        out[(frame + 1) * ch..].fill(0.0);
                    }
                    return progress;
                }
            }
        }

        progress
    }
}
