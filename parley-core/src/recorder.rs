//! `TurnRecorder`: one push-to-talk capture session.
//!
//! ## Lifecycle
//!
//! ```text
//! TurnRecorder::start()
//!     ├─► capture_ring()            fixed-capacity SPSC ring
//!     ├─► CaptureBackend::open()    device callback owns the CaptureWriter
//!     └─► spawn drain thread        wait ≤ wait_interval → drain → convert
//! TurnRecorder::stop()
//!     ├─► CaptureHandle::stop()     callback goes quiet
//!     ├─► stop flag + wake          drain thread does one last drain
//!     └─► join                      → Recording at target_sample_rate
//! ```
//!
//! The device handle is created and dropped on the thread that calls
//! `start`/`stop` (`cpal::Stream` is `!Send`); only the `CaptureReader`
//! crosses into the drain thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{
        capture_ring, chunk::Recording, CaptureReader, CaptureWaker, CaptureWriter,
        DEFAULT_RING_CAPACITY,
    },
    error::{ParleyError, Result},
};

/// An input device able to feed mono f32 frames into a capture ring.
pub trait CaptureBackend {
    /// Open and start the device. From now on its callback writes into
    /// `writer` and must never block.
    ///
    /// # Errors
    /// A device that cannot be opened at a usable format is a fatal error.
    fn open(&mut self, writer: CaptureWriter) -> Result<Box<dyn CaptureHandle>>;
}

/// A running capture stream. Dropping it releases the device.
pub trait CaptureHandle {
    /// Rate of the frames written into the ring (Hz).
    fn sample_rate(&self) -> u32;

    /// Halt the callback. No frames are written after this returns.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RecorderConfig {
    /// Rate of the returned recording (Hz). Default: 16000.
    pub target_sample_rate: u32,
    /// Ring size in frames, fixed for the session. Default: 5 s at 48 kHz.
    pub ring_capacity_frames: usize,
    /// Upper bound on how long the drain thread sleeps without data.
    pub wait_interval: Duration,
    /// Frames per read from the ring and per resampler block. Default: 1600.
    pub drain_chunk_frames: usize,
    /// Recordings shorter than this are "nothing captured". Default: 1600
    /// (0.1 s at 16 kHz).
    pub min_recording_samples: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            ring_capacity_frames: DEFAULT_RING_CAPACITY,
            wait_interval: Duration::from_millis(100),
            drain_chunk_frames: 1_600,
            min_recording_samples: 1_600,
        }
    }
}

struct ActiveRecording {
    handle: Box<dyn CaptureHandle>,
    stop: Arc<AtomicBool>,
    waker: CaptureWaker,
    worker: JoinHandle<Vec<f32>>,
    source_rate: u32,
    started_at: Instant,
}

pub struct TurnRecorder {
    backend: Box<dyn CaptureBackend>,
    config: RecorderConfig,
    active: Option<ActiveRecording>,
}

impl TurnRecorder {
    pub fn new(backend: Box<dyn CaptureBackend>, config: RecorderConfig) -> Self {
        Self {
            backend,
            config,
            active: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open the device and start draining it.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyRecording` if a session is active.
    /// - Device errors from the backend; nothing is left running.
    pub fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(ParleyError::AlreadyRecording);
        }

        let (writer, reader) = capture_ring(self.config.ring_capacity_frames);
        let waker = reader.waker();
        let mut handle = self.backend.open(writer)?;
        let source_rate = handle.sample_rate();

        let converter = match RateConverter::new(
            source_rate,
            self.config.target_sample_rate,
            self.config.drain_chunk_frames,
        ) {
            Ok(c) => c,
            Err(e) => {
                handle.stop();
                return Err(e);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = DrainContext {
            reader,
            converter,
            stop: Arc::clone(&stop),
            wait_interval: self.config.wait_interval,
            chunk_frames: self.config.drain_chunk_frames,
            expected_samples: self.config.target_sample_rate as usize * 30,
        };

        let worker = match thread::Builder::new()
            .name("parley-capture-drain".into())
            .spawn(move || drain_loop(ctx))
        {
            Ok(w) => w,
            Err(e) => {
                handle.stop();
                return Err(ParleyError::Io(e));
            }
        };

        info!(
            source_rate,
            target_rate = self.config.target_sample_rate,
            "recording started"
        );

        self.active = Some(ActiveRecording {
            handle,
            stop,
            waker,
            worker,
            source_rate,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Halt the device, wait for the drain thread to empty the ring, and
    /// return everything captured since `start`.
    ///
    /// # Errors
    /// - `ParleyError::NotRecording` if no session is active.
    pub fn stop(&mut self) -> Result<Recording> {
        let Some(mut active) = self.active.take() else {
            return Err(ParleyError::NotRecording);
        };

        active.handle.stop();
        active.stop.store(true, Ordering::Release);
        active.waker.wake();

        let samples = active.worker.join().map_err(|_| {
            ParleyError::Other(anyhow::anyhow!("capture drain thread panicked"))
        })?;
        let stats = active.waker.stats();
        drop(active.handle);

        if stats.dropped > 0 {
            warn!(
                dropped = stats.dropped,
                offered = stats.offered,
                "capture ring overflowed; newest frames were dropped"
            );
        }

        let recording = Recording {
            samples,
            sample_rate: self.config.target_sample_rate,
            dropped_frames: stats.dropped,
        };
        info!(
            samples = recording.len(),
            seconds = format_args!("{:.2}", recording.duration_secs()),
            source_rate = active.source_rate,
            wall_ms = active.started_at.elapsed().as_millis() as u64,
            "recording stopped"
        );
        Ok(recording)
    }

    /// Whether `recording` is long enough to be worth recognising.
    pub fn meets_minimum(&self, recording: &Recording) -> bool {
        recording.len() >= self.config.min_recording_samples
    }
}

impl Drop for TurnRecorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            debug!("recorder dropped while active; stopping capture");
            let _ = self.stop();
        }
    }
}

struct DrainContext {
    reader: CaptureReader,
    converter: RateConverter,
    stop: Arc<AtomicBool>,
    wait_interval: Duration,
    chunk_frames: usize,
    expected_samples: usize,
}

/// Drain thread body. Runs until the stop flag is seen, then drains once
/// more so frames written before the device halted are kept.
fn drain_loop(mut ctx: DrainContext) -> Vec<f32> {
    let mut raw = Vec::with_capacity(ctx.chunk_frames);
    let mut samples = Vec::with_capacity(ctx.expected_samples);

    loop {
        let stopping = ctx.stop.load(Ordering::Acquire);

        raw.clear();
        if ctx.reader.drain_into(&mut raw, ctx.chunk_frames) > 0 {
            ctx.converter.process_into(&raw, &mut samples);
        }

        if stopping {
            break;
        }
        ctx.reader.wait_for_data(ctx.wait_interval, &ctx.stop);
    }

    ctx.converter.flush_into(&mut samples);
    samples
}
