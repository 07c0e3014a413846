//! `SynthesisStreamer`: phrase chunks in, continuous audio out.
//!
//! ```text
//! queue(chunk) ──► PhraseQueue ──► worker thread ──► crossbeam channel ──► device callback
//!                  (Mutex+Condvar)  sanitize+render    (QueuedAudio)        PlaybackCursor
//! ```
//!
//! The playback device is opened once at the synthesizer's native rate and
//! stays open for the life of the streamer. The worker is spawned on the
//! first chunk of a turn and joined by [`SynthesisStreamer::finish`], so no
//! thread outlives its turn. A turn with no chunks never spawns one.

pub mod playback;
pub mod sanitize;

use std::collections::VecDeque;
use std::sync::{atomic::Ordering, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ParleyError, Result},
    inference::SynthHandle,
    segmenter::PhraseChunk,
};

pub use playback::{PlaybackBackend, PlaybackCursor, PlaybackHandle, PlaybackProgress, QueuedAudio};
pub use sanitize::{is_speakable, sanitize_for_speech};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SynthesisConfig {
    /// Speaking rate handed to the synthesizer. Default: 1.2.
    pub speed: f32,
    /// How long `finish` waits for playback to move before giving up.
    pub drain_grace: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            speed: 1.2,
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// What one turn of streaming produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReport {
    pub chunks_queued: usize,
    pub chunks_rendered: usize,
    /// Chunks with nothing speakable after sanitising.
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub frames_rendered: u64,
    pub underrun_frames: u64,
    /// False if playback stalled and `finish` gave up waiting.
    pub drained: bool,
}

#[derive(Debug, Default)]
struct WorkerReport {
    rendered: usize,
    skipped: usize,
    failed: usize,
    frames: u64,
}

struct PhraseQueueState {
    items: VecDeque<PhraseChunk>,
    closed: bool,
}

/// FIFO between the control thread and the synthesis worker.
struct PhraseQueue {
    state: Mutex<PhraseQueueState>,
    ready: Condvar,
}

impl PhraseQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(PhraseQueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, chunk: PhraseChunk) {
        self.state.lock().items.push_back(chunk);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    fn reopen(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.closed = false;
    }

    /// Next chunk, blocking while the queue is open and empty. `None` once
    /// closed and drained.
    fn pop(&self) -> Option<PhraseChunk> {
        let mut state = self.state.lock();
        loop {
            if let Some(chunk) = state.items.pop_front() {
                return Some(chunk);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }
}

struct WorkerContext {
    synth: SynthHandle,
    phrases: Arc<PhraseQueue>,
    audio_tx: Sender<QueuedAudio>,
    progress: Arc<PlaybackProgress>,
    speed: f32,
    device_rate: u32,
}

pub struct SynthesisStreamer {
    synth: SynthHandle,
    config: SynthesisConfig,
    playback: Box<dyn PlaybackHandle>,
    device_rate: u32,
    audio_tx: Sender<QueuedAudio>,
    progress: Arc<PlaybackProgress>,
    phrases: Arc<PhraseQueue>,
    worker: Option<JoinHandle<WorkerReport>>,
    worker_spawns: usize,
    queued: usize,
    underrun_mark: u64,
}

impl SynthesisStreamer {
    /// Open the playback device at the synthesizer's native rate.
    ///
    /// # Errors
    /// Device errors from `backend`, or `UnsupportedConfig` if the device
    /// came up at a different rate.
    pub fn open(
        synth: SynthHandle,
        backend: &mut dyn PlaybackBackend,
        config: SynthesisConfig,
    ) -> Result<Self> {
        let device_rate = synth.native_sample_rate();
        let (audio_tx, audio_rx) = unbounded();
        let progress = Arc::new(PlaybackProgress::default());
        let cursor = PlaybackCursor::new(audio_rx, Arc::clone(&progress));

        let mut playback = backend.open(device_rate, cursor)?;
        if playback.sample_rate() != device_rate {
            playback.stop();
            return Err(ParleyError::UnsupportedConfig(format!(
                "playback device runs at {} Hz, synthesizer renders at {} Hz",
                playback.sample_rate(),
                device_rate
            )));
        }
        info!(sample_rate = device_rate, speed = config.speed, "playback device open");

        Ok(Self {
            synth,
            config,
            playback,
            device_rate,
            audio_tx,
            progress,
            phrases: Arc::new(PhraseQueue::new()),
            worker: None,
            worker_spawns: 0,
            queued: 0,
            underrun_mark: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.device_rate
    }

    /// Worker threads started over the streamer's life (one per speaking turn).
    pub fn worker_spawns(&self) -> usize {
        self.worker_spawns
    }

    /// Hand a phrase to the worker. Starts the worker on the first chunk of
    /// a turn. Never blocks on rendering.
    pub fn queue(&mut self, chunk: PhraseChunk) -> Result<()> {
        if self.worker.is_none() {
            self.spawn_worker()?;
        }
        debug!(index = chunk.index, text = %chunk.text, "phrase queued");
        self.phrases.push(chunk);
        self.queued += 1;
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let ctx = WorkerContext {
            synth: self.synth.clone(),
            phrases: Arc::clone(&self.phrases),
            audio_tx: self.audio_tx.clone(),
            progress: Arc::clone(&self.progress),
            speed: self.config.speed,
            device_rate: self.device_rate,
        };
        self.underrun_mark = self.progress.underrun_frames.load(Ordering::Relaxed);
        self.progress.speaking.store(true, Ordering::Relaxed);

        let handle = thread::Builder::new()
            .name("parley-synthesis".into())
            .spawn(move || synthesis_worker(ctx))?;
        self.worker = Some(handle);
        self.worker_spawns += 1;
        Ok(())
    }

    /// End the turn: close the phrase queue, join the worker, then wait for
    /// the device to play everything that was rendered.
    ///
    /// Returns immediately when nothing was queued this turn.
    pub fn finish(&mut self) -> StreamReport {
        let Some(worker) = self.worker.take() else {
            return StreamReport {
                drained: true,
                ..StreamReport::default()
            };
        };

        self.phrases.close();
        let work = worker.join().unwrap_or_else(|_| {
            error!("synthesis worker panicked");
            WorkerReport::default()
        });

        let drained = self.wait_for_drain();
        self.progress.speaking.store(false, Ordering::Relaxed);
        self.phrases.reopen();

        let report = StreamReport {
            chunks_queued: std::mem::take(&mut self.queued),
            chunks_rendered: work.rendered,
            chunks_skipped: work.skipped,
            chunks_failed: work.failed,
            frames_rendered: work.frames,
            underrun_frames: self
                .progress
                .underrun_frames
                .load(Ordering::Relaxed)
                .saturating_sub(self.underrun_mark),
            drained,
        };
        info!(
            queued = report.chunks_queued,
            rendered = report.chunks_rendered,
            skipped = report.chunks_skipped,
            failed = report.chunks_failed,
            underrun_frames = report.underrun_frames,
            "speech stream finished"
        );
        report
    }

    /// Wait until every enqueued buffer has been played. Gives up after
    /// `drain_grace` with no playback movement at all.
    fn wait_for_drain(&self) -> bool {
        let grace = self.config.drain_grace;
        let mut last_frames = self.progress.played_frames.load(Ordering::Relaxed);
        let mut deadline = Instant::now() + grace;

        while self.progress.pending_buffers() > 0 {
            self.progress.wait_for_progress(Duration::from_millis(50));

            let frames = self.progress.played_frames.load(Ordering::Relaxed);
            if frames != last_frames {
                last_frames = frames;
                deadline = Instant::now() + grace;
            } else if Instant::now() >= deadline {
                warn!(
                    pending = self.progress.pending_buffers(),
                    "playback stalled; abandoning drain"
                );
                return false;
            }
        }
        true
    }
}

impl Drop for SynthesisStreamer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.finish();
        }
        self.playback.stop();
    }
}

fn synthesis_worker(ctx: WorkerContext) -> WorkerReport {
    let mut report = WorkerReport::default();

    while let Some(chunk) = ctx.phrases.pop() {
        let text = sanitize_for_speech(&chunk.text);
        if !is_speakable(&text) {
            debug!(index = chunk.index, "nothing speakable; phrase skipped");
            report.skipped += 1;
            continue;
        }

        let started = Instant::now();
        let rendered = ctx.synth.0.lock().render(&text, ctx.speed);
        let audio = match rendered {
            Ok(audio) => audio,
            Err(e) => {
                warn!(index = chunk.index, error = %e, "synthesis failed; phrase skipped");
                report.failed += 1;
                continue;
            }
        };

        if audio.sample_rate != ctx.device_rate {
            warn!(
                index = chunk.index,
                rendered_rate = audio.sample_rate,
                device_rate = ctx.device_rate,
                "rendered audio at the wrong rate; phrase skipped"
            );
            report.failed += 1;
            continue;
        }
        if audio.samples.is_empty() {
            report.skipped += 1;
            continue;
        }

        debug!(
            index = chunk.index,
            frames = audio.frames(),
            audio_ms = (audio.duration_secs() * 1_000.0) as u64,
            render_ms = started.elapsed().as_millis() as u64,
            "phrase rendered"
        );
        report.rendered += 1;
        report.frames += audio.frames() as u64;

        ctx.progress.enqueued_buffers.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedAudio {
            index: chunk.index,
            samples: audio.samples,
        };
        if ctx.audio_tx.send(queued).is_err() {
            ctx.progress.enqueued_buffers.fetch_sub(1, Ordering::AcqRel);
            error!("playback device went away; stopping synthesis");
            break;
        }
    }

    report
}
