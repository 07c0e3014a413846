//! Playback side of the streamer: the cursor the device callback pulls from.
//!
//! The callback runs on the audio thread and must never wait. Rendered
//! buffers arrive over a crossbeam channel and are taken with `try_recv`;
//! when nothing is ready the cursor yields silence.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// An output device that plays mono f32 pulled from a [`PlaybackCursor`].
pub trait PlaybackBackend {
    /// Open and start the device at `sample_rate`. The callback owns
    /// `cursor` from now on.
    ///
    /// # Errors
    /// A device that cannot run at `sample_rate` is a fatal error; the audio
    /// is never resampled for playback.
    fn open(&mut self, sample_rate: u32, cursor: PlaybackCursor) -> Result<Box<dyn PlaybackHandle>>;
}

/// A running playback stream. Dropping it releases the device.
pub trait PlaybackHandle {
    fn sample_rate(&self) -> u32;

    fn stop(&mut self);
}

/// One rendered phrase on its way to the device.
#[derive(Debug)]
pub struct QueuedAudio {
    pub index: usize,
    pub samples: Vec<f32>,
}

/// Counters shared between the streamer and the playback callback.
#[derive(Default)]
pub struct PlaybackProgress {
    pub enqueued_buffers: AtomicU64,
    pub played_buffers: AtomicU64,
    /// Frames pulled from rendered buffers (not silence).
    pub played_frames: AtomicU64,
    /// Silent frames emitted while a turn was speaking.
    pub underrun_frames: AtomicU64,
    /// Set for the duration of a speaking turn.
    pub speaking: AtomicBool,
    lock: Mutex<()>,
    advanced: Condvar,
}

impl PlaybackProgress {
    pub fn pending_buffers(&self) -> u64 {
        let enqueued = self.enqueued_buffers.load(Ordering::Acquire);
        let played = self.played_buffers.load(Ordering::Acquire);
        enqueued.saturating_sub(played)
    }

    /// Called from the audio thread; never takes the lock.
    fn notify(&self) {
        self.advanced.notify_all();
    }

    /// Sleep until the callback reports progress or `timeout` passes.
    pub fn wait_for_progress(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        if self.pending_buffers() == 0 {
            return;
        }
        self.advanced.wait_for(&mut guard, timeout);
    }
}

/// Device-side reader of the rendered-audio queue.
pub struct PlaybackCursor {
    rx: Receiver<QueuedAudio>,
    current: Option<QueuedAudio>,
    position: usize,
    pulled: u64,
    silent: u64,
    progress: Arc<PlaybackProgress>,
}

impl PlaybackCursor {
    pub fn new(rx: Receiver<QueuedAudio>, progress: Arc<PlaybackProgress>) -> Self {
        Self {
            rx,
            current: None,
            position: 0,
            pulled: 0,
            silent: 0,
            progress,
        }
    }

    /// Next mono sample, or `0.0` when nothing has been rendered yet.
    pub fn next_sample(&mut self) -> f32 {
        match self.pull() {
            Some(sample) => {
                self.pulled += 1;
                sample
            }
            None => {
                self.silent += 1;
                0.0
            }
        }
    }

    /// Fill `out` with mono samples and publish progress. Returns the
    /// number of frames that came from rendered audio.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let before = self.pulled;
        for sample in out.iter_mut() {
            *sample = self.next_sample();
        }
        let produced = (self.pulled - before) as usize;
        self.publish();
        produced
    }

    /// Flush per-callback counters to the shared progress. Call once at the
    /// end of each device callback when using `next_sample` directly.
    pub fn publish(&mut self) {
        if self.pulled > 0 {
            self.progress
                .played_frames
                .fetch_add(self.pulled, Ordering::Relaxed);
            self.pulled = 0;
            self.progress.notify();
        }
        if self.silent > 0 {
            if self.progress.speaking.load(Ordering::Relaxed) {
                self.progress
                    .underrun_frames
                    .fetch_add(self.silent, Ordering::Relaxed);
            }
            self.silent = 0;
        }
    }

    fn pull(&mut self) -> Option<f32> {
        loop {
            if let Some(buffer) = self.current.as_ref() {
                if let Some(&sample) = buffer.samples.get(self.position) {
                    self.position += 1;
                    return Some(sample);
                }
            }
            if self.current.take().is_some() {
                self.progress.played_buffers.fetch_add(1, Ordering::AcqRel);
                self.progress.notify();
            }
            match self.rx.try_recv() {
                Ok(next) => {
                    self.current = Some(next);
                    self.position = 0;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn cursor() -> (
        crossbeam_channel::Sender<QueuedAudio>,
        PlaybackCursor,
        Arc<PlaybackProgress>,
    ) {
        let (tx, rx) = unbounded();
        let progress = Arc::new(PlaybackProgress::default());
        (tx, PlaybackCursor::new(rx, Arc::clone(&progress)), progress)
    }

    #[test]
    fn empty_queue_yields_silence() {
        let (_tx, mut cursor, progress) = cursor();
        progress.speaking.store(true, Ordering::Relaxed);
        let mut out = [1.0f32; 64];
        assert_eq!(cursor.fill(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(progress.underrun_frames.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn idle_silence_is_not_an_underrun() {
        let (_tx, mut cursor, progress) = cursor();
        let mut out = [0.0f32; 32];
        cursor.fill(&mut out);
        assert_eq!(progress.underrun_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn buffers_play_back_to_back_in_order() {
        let (tx, mut cursor, progress) = cursor();
        for (index, value) in [(0, 1.0f32), (1, 2.0), (2, 3.0)] {
            progress.enqueued_buffers.fetch_add(1, Ordering::AcqRel);
            tx.send(QueuedAudio {
                index,
                samples: vec![value; 3],
            })
            .unwrap();
        }

        let mut out = [0.0f32; 12];
        assert_eq!(cursor.fill(&mut out), 9);
        assert_eq!(
            out,
            [1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(progress.played_buffers.load(Ordering::Acquire), 3);
        assert_eq!(progress.played_frames.load(Ordering::Relaxed), 9);
        assert_eq!(progress.pending_buffers(), 0);
    }

    #[test]
    fn buffer_spans_callbacks() {
        let (tx, mut cursor, progress) = cursor();
        progress.enqueued_buffers.fetch_add(1, Ordering::AcqRel);
        tx.send(QueuedAudio {
            index: 0,
            samples: vec![0.5; 10],
        })
        .unwrap();

        let mut out = [0.0f32; 4];
        assert_eq!(cursor.fill(&mut out), 4);
        assert_eq!(progress.pending_buffers(), 1);
        assert_eq!(cursor.fill(&mut out), 4);
        assert_eq!(cursor.fill(&mut out), 2);
        assert_eq!(progress.pending_buffers(), 0);
    }

    #[test]
    fn fill_after_unpublished_samples_counts_its_own_frames() {
        let (tx, mut cursor, progress) = cursor();
        progress.enqueued_buffers.fetch_add(1, Ordering::AcqRel);
        tx.send(QueuedAudio {
            index: 0,
            samples: vec![0.25; 6],
        })
        .unwrap();

        assert_eq!(cursor.next_sample(), 0.25);
        assert_eq!(cursor.next_sample(), 0.25);
        let mut out = [0.0f32; 3];
        assert_eq!(cursor.fill(&mut out), 3);
        assert_eq!(progress.played_frames.load(Ordering::Relaxed), 5);
    }
}
