//! Lock-free SPSC capture ring between the audio callback and the turn recorder.
//!
//! Backed by `ringbuf::HeapRb<f32>`. The data path is wait-free: the writer
//! only moves its write cursor, the reader only moves its read cursor. The
//! `parking_lot` condvar in [`DataSignal`] carries the "data became available"
//! wake-up and never guards sample data.
//!
//! ```text
//! cpal callback ──► CaptureWriter::write ──► HeapRb ──► CaptureReader::acquire_read
//!                        │ (drop count)                         │
//!                        └──────── DataSignal::notify ──────────┘ (bounded wait)
//! ```

pub mod chunk;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

/// Default ring capacity: five seconds of mono audio at 48 kHz.
pub const DEFAULT_RING_CAPACITY: usize = 48_000 * 5;

/// Counters shared by both halves of the ring.
#[derive(Debug, Default)]
pub struct CaptureStats {
    offered: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            offered: self.offered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStatsSnapshot {
    /// Frames handed to the writer.
    pub offered: u64,
    /// Frames rejected because the ring was full.
    pub dropped: u64,
    /// Frames committed as read by the consumer.
    pub delivered: u64,
}

/// Wake-up channel from the producer to a consumer blocked in a bounded wait.
#[derive(Debug, Default)]
pub struct DataSignal {
    lock: Mutex<()>,
    ready: Condvar,
}

impl DataSignal {
    /// Never takes the lock, so it is safe to call from the audio callback.
    pub fn notify(&self) {
        self.ready.notify_one();
    }

    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    /// Wait until notified or `timeout` elapses, unless `skip_wait` already
    /// holds once the lock is taken.
    fn wait_for(&self, timeout: Duration, skip_wait: impl FnOnce() -> bool) {
        let mut guard = self.lock.lock();
        if skip_wait() {
            return;
        }
        let _ = self.ready.wait_for(&mut guard, timeout);
    }
}

#[derive(Debug, Default)]
struct RingShared {
    stats: CaptureStats,
    signal: DataSignal,
}

/// Producer half, owned by the hardware capture callback.
pub struct CaptureWriter {
    producer: HeapProd<f32>,
    shared: Arc<RingShared>,
}

/// Consumer half, owned by the turn recorder's drain thread.
pub struct CaptureReader {
    consumer: HeapCons<f32>,
    shared: Arc<RingShared>,
}

/// Cloneable handle that wakes a reader blocked in [`CaptureReader::wait_for_data`].
#[derive(Clone)]
pub struct CaptureWaker {
    shared: Arc<RingShared>,
}

/// Create a matched writer/reader pair over a fixed-capacity ring.
///
/// The capacity never changes after this call.
pub fn capture_ring(capacity: usize) -> (CaptureWriter, CaptureReader) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
    let shared = Arc::new(RingShared::default());
    (
        CaptureWriter {
            producer,
            shared: Arc::clone(&shared),
        },
        CaptureReader { consumer, shared },
    )
}

/// Writable reservation returned by [`CaptureWriter::acquire_write`].
///
/// Only the writer advances the write cursor, so the granted space cannot
/// shrink before [`WriteGrant::commit`] runs.
pub struct WriteGrant<'a> {
    writer: &'a mut CaptureWriter,
    frames: usize,
}

impl WriteGrant<'_> {
    /// Frames that may be committed.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Publish up to `frames()` samples from `samples`. Returns frames written.
    pub fn commit(self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.frames);
        self.writer.producer.push_slice(&samples[..n])
    }
}

impl CaptureWriter {
    /// Reserve space for at most `max_frames` samples.
    pub fn acquire_write(&mut self, max_frames: usize) -> WriteGrant<'_> {
        let frames = max_frames.min(self.producer.vacant_len());
        WriteGrant {
            writer: self,
            frames,
        }
    }

    /// Offer `samples` to the ring. Never blocks: whatever does not fit is
    /// dropped and counted. Returns frames written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let grant = self.acquire_write(samples.len());
        let written = grant.commit(samples);

        let stats = &self.shared.stats;
        stats
            .offered
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        let dropped = samples.len() - written;
        if dropped > 0 {
            stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        if written > 0 {
            self.shared.signal.notify();
        }
        written
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity().get()
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl CaptureReader {
    pub fn available_to_read(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Borrow the oldest contiguous run of at most `max_frames` samples.
    ///
    /// May return fewer frames than are available when the data wraps the
    /// end of the ring; call again after [`CaptureReader::commit_read`].
    pub fn acquire_read(&self, max_frames: usize) -> &[f32] {
        let (head, tail) = self.consumer.as_slices();
        let region = if head.is_empty() { tail } else { head };
        &region[..region.len().min(max_frames)]
    }

    /// Release `frames` samples previously returned by `acquire_read`.
    pub fn commit_read(&mut self, frames: usize) {
        let released = self.consumer.skip(frames);
        self.shared
            .stats
            .delivered
            .fetch_add(released as u64, Ordering::Relaxed);
    }

    /// Move every available frame into `out`, `chunk_frames` at a time.
    /// Returns the number of frames moved.
    pub fn drain_into(&mut self, out: &mut Vec<f32>, chunk_frames: usize) -> usize {
        let mut moved = 0;
        loop {
            let region = self.acquire_read(chunk_frames.max(1));
            let n = region.len();
            if n == 0 {
                break;
            }
            out.extend_from_slice(region);
            self.commit_read(n);
            moved += n;
        }
        moved
    }

    /// Block for at most `timeout` waiting for the writer, returning early
    /// when data is already queued or `stop` is set.
    pub fn wait_for_data(&self, timeout: Duration, stop: &AtomicBool) {
        self.shared.signal.wait_for(timeout, || {
            stop.load(Ordering::Acquire) || self.available_to_read() > 0
        });
    }

    pub fn waker(&self) -> CaptureWaker {
        CaptureWaker {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl CaptureWaker {
    pub fn wake(&self) {
        self.shared.signal.notify_all();
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.shared.stats.snapshot()
    }
}
