//! Asynchronous chunk decoding.
//!
//! A small pool of decode workers turns wave readers into interleaved
//! chunks. A job owns everything it touches (the reader and the destination
//! chunk), so no decode buffer can be freed while a worker still writes it;
//! the result carries both back through a per-source reply channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use onda_core::Sample;

use crate::{DecodeProgress, LoopingMode, PcmData, ProceduralHandle, StreamingDecoder};

/// Worker idle poll interval while waiting for the shutdown flag.
const IDLE_POLL: Duration = Duration::from_millis(2);

/// Read cursor over resident PCM.
pub(crate) struct RawPcmReader {
    data: Arc<PcmData>,
    frame_pos: u64,
}

impl RawPcmReader {
    pub(crate) fn new(data: Arc<PcmData>, start_frame: u64) -> Self {
        let frame_pos = start_frame.min(data.num_frames());
        Self { data, frame_pos }
    }

    fn read(&mut self, out: &mut [Sample], looping: LoopingMode) -> DecodeProgress {
        let channels = self.data.num_channels();
        let total_frames = self.data.num_frames();
        let capacity = out.len() / channels;
        let samples = self.data.samples();

        let mut written = 0usize;
        let mut looped = false;
        let mut finished = false;

        while written < capacity {
            if self.frame_pos >= total_frames {
                match looping {
                    LoopingMode::Loop if total_frames > 0 => {
                        self.frame_pos = 0;
                        looped = true;
                    }
                    _ => {
                        finished = true;
                        break;
                    }
                }
            }
            let run = ((total_frames - self.frame_pos) as usize).min(capacity - written);
            let src = self.frame_pos as usize * channels;
            let dst = written * channels;
            out[dst..dst + run * channels].copy_from_slice(&samples[src..src + run * channels]);
            self.frame_pos += run as u64;
            written += run;
        }

        if written < capacity {
            out[written * channels..].fill(0.0);
        }
        if matches!(looping, LoopingMode::None) && self.frame_pos >= total_frames {
            finished = true;
        }

        DecodeProgress {
            frames_written: written,
            looped,
            finished,
        }
    }
}

/// Reader state a decode job drives; moved into the job and back out with
/// the result so exactly one thread touches it at a time.
pub(crate) enum WaveReader {
    RawPcm(RawPcmReader),
    Streaming {
        decoder: Box<dyn StreamingDecoder>,
        num_channels: usize,
    },
    Procedural {
        handle: ProceduralHandle,
        num_channels: usize,
    },
}

impl WaveReader {
    pub(crate) fn run(&mut self, chunk: &mut [Sample], looping: LoopingMode) -> DecodeProgress {
        match self {
            Self::RawPcm(reader) => reader.read(chunk, looping),
            Self::Streaming { decoder, num_channels } => {
                let progress = decoder.decode(chunk, looping);
                let filled = progress.frames_written * *num_channels;
                if filled < chunk.len() {
                    chunk[filled..].fill(0.0);
                }
                progress
            }
            Self::Procedural { handle, num_channels } => {
                let (frames_written, finished) = handle.generate(chunk);
                let filled = frames_written * *num_channels;
                if filled < chunk.len() {
                    chunk[filled..].fill(0.0);
                }
                DecodeProgress {
                    frames_written,
                    looped: false,
                    finished,
                }
            }
        }
    }
}

/// One decode request: fill `chunk` from `reader`, reply when done.
pub(crate) struct DecodeJob {
    pub reader: WaveReader,
    pub chunk: Vec<Sample>,
    pub looping: LoopingMode,
    pub reply: Sender<DecodeResult>,
}

/// Completed decode, carrying the reader and chunk back to the source.
pub(crate) struct DecodeResult {
    pub reader: WaveReader,
    pub chunk: Vec<Sample>,
    pub progress: DecodeProgress,
}

impl DecodeJob {
    fn run(mut self) {
        let progress = self.reader.run(&mut self.chunk, self.looping);
        // The source may have been released while we decoded; a failed send
        // just drops the reader and chunk here on the worker.
        let _ = self.reply.send(DecodeResult {
            reader: self.reader,
            chunk: self.chunk,
            progress,
        });
    }
}

/// Cloneable job submission endpoint handed to every `SourceBuffer`.
#[derive(Clone)]
pub struct DecodeScheduler {
    job_tx: Sender<DecodeJob>,
    /// No workers are alive; run jobs on the calling thread instead of
    /// queueing them forever.
    inline: bool,
}

impl DecodeScheduler {
    pub(crate) fn submit(&self, job: DecodeJob) {
        if self.inline {
            job.run();
            return;
        }
        if let Err(send_error) = self.job_tx.send(job) {
            send_error.into_inner().run();
        }
    }

    /// Reply channel pair sized for the one-outstanding-task discipline.
    pub(crate) fn reply_channel() -> (Sender<DecodeResult>, Receiver<DecodeResult>) {
        bounded(1)
    }
}

/// Decode worker pool for background chunk decoding.
pub struct DecodePool {
    job_tx: Sender<DecodeJob>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl DecodePool {
    /// Create a pool with `num_workers` threads (clamped to at least one
    /// requested; falls back to inline decoding if none spawn).
    pub fn new(num_workers: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<DecodeJob>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let num_workers = num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let rx = job_rx.clone();
            let flag = Arc::clone(&shutdown);

            match thread::Builder::new()
                .name(format!("onda-decode-{i}"))
                .spawn(move || worker_loop(i, rx, flag))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::error!("Failed to spawn decode worker {i}: {e}. Decoding may be degraded.");
                }
            }
        }

        log::debug!("Decode pool running with {} workers", workers.len());

        Self {
            job_tx,
            workers,
            shutdown,
        }
    }

    pub fn scheduler(&self) -> DecodeScheduler {
        DecodeScheduler {
            job_tx: self.job_tx.clone(),
            inline: self.workers.is_empty(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop the workers after they drain queued jobs.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: Receiver<DecodeJob>, shutdown: Arc<AtomicBool>) {
    log::debug!("Decode worker {index} running");

    loop {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(job) => job.run(),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("Decode worker {index} exiting");
}
