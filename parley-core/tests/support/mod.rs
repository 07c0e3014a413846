//! Fake devices and engines shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_core::buffering::CaptureWriter;
use parley_core::inference::FinishReason;
use parley_core::recorder::{CaptureBackend, CaptureHandle};
use parley_core::synthesis::{PlaybackBackend, PlaybackCursor, PlaybackHandle};
use parley_core::{
    FragmentStream, LanguageModel, ParleyError, RenderedAudio, Result, SpeechSynthesizer,
};

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Writes `frames` samples of a quiet ramp from its own thread on open.
pub struct BurstCapture {
    pub frames: usize,
    pub rate: u32,
}

pub struct BurstHandle {
    rate: u32,
    thread: Option<JoinHandle<()>>,
}

impl CaptureBackend for BurstCapture {
    fn open(&mut self, mut writer: CaptureWriter) -> Result<Box<dyn CaptureHandle>> {
        let frames = self.frames;
        let thread = thread::spawn(move || {
            let burst: Vec<f32> = (0..frames).map(|i| (i % 100) as f32 * 1e-3).collect();
            for block in burst.chunks(400) {
                writer.write(block);
            }
        });
        Ok(Box::new(BurstHandle {
            rate: self.rate,
            thread: Some(thread),
        }))
    }
}

impl CaptureHandle for BurstHandle {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn stop(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// One label's stretch of played audio.
#[derive(Debug, Clone, Copy)]
pub struct PlayedRun {
    pub label: f32,
    pub frames: usize,
    pub first: Instant,
    pub last: Instant,
}

/// Pulls `block` frames every `period`, roughly like a real device, and
/// records runs of identical non-silent samples.
pub struct PacedPlayback {
    pub block: usize,
    pub period: Duration,
    pub runs: Arc<Mutex<Vec<PlayedRun>>>,
}

impl PacedPlayback {
    pub fn new(block: usize, period: Duration) -> Self {
        Self {
            block,
            period,
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fast enough that playback never holds a test up.
    pub fn instant() -> Self {
        Self::new(4_096, Duration::from_millis(1))
    }
}

pub struct PacedHandle {
    rate: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackBackend for PacedPlayback {
    fn open(&mut self, sample_rate: u32, mut cursor: PlaybackCursor) -> Result<Box<dyn PlaybackHandle>> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let runs = Arc::clone(&self.runs);
        let (block, period) = (self.block, self.period);

        let thread = thread::spawn(move || {
            let mut buf = vec![0.0f32; block];
            while flag.load(Ordering::Acquire) {
                cursor.fill(&mut buf);
                let now = Instant::now();
                let mut runs = runs.lock();
                for &s in buf.iter().filter(|&&s| s != 0.0) {
                    match runs.last_mut() {
                        Some(run) if run.label == s => {
                            run.frames += 1;
                            run.last = now;
                        }
                        _ => runs.push(PlayedRun {
                            label: s,
                            frames: 1,
                            first: now,
                            last: now,
                        }),
                    }
                }
                drop(runs);
                thread::sleep(period);
            }
        });

        Ok(Box::new(PacedHandle {
            rate: sample_rate,
            running,
            thread: Some(thread),
        }))
    }
}

impl PlaybackHandle for PacedHandle {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Wait until `runs` account for `frames` played frames (the fake device
/// records a block just after pulling it).
pub fn wait_for_frames(runs: &Mutex<Vec<PlayedRun>>, frames: usize) -> Vec<PlayedRun> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = runs.lock().clone();
        let total: usize = snapshot.iter().map(|r| r.frames).sum();
        if total >= frames || Instant::now() >= deadline {
            return snapshot;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Renders a phrase whose text starts with a number `n` as `frames`
/// samples of value `n`, sleeping `delays[n]` first. Logs render starts.
pub struct LabelSynth {
    pub rate: u32,
    pub frames: usize,
    pub delays: Vec<Duration>,
    pub starts: Arc<Mutex<Vec<(usize, Instant)>>>,
}

impl LabelSynth {
    pub fn new(rate: u32, frames: usize, delays: Vec<Duration>) -> Self {
        Self {
            rate,
            frames,
            delays,
            starts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SpeechSynthesizer for LabelSynth {
    fn native_sample_rate(&self) -> u32 {
        self.rate
    }

    fn render(&mut self, text: &str, _speed: f32) -> Result<RenderedAudio> {
        let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
        let label: usize = digits
            .parse()
            .map_err(|_| ParleyError::Synthesis(format!("unlabelled phrase: {text}")))?;
        self.starts.lock().push((label, Instant::now()));
        if let Some(delay) = self.delays.get(label) {
            thread::sleep(*delay);
        }
        Ok(RenderedAudio::new(vec![label as f32; self.frames], self.rate))
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Replays canned replies and logs every prompt and context append.
pub struct ReplayModel {
    replies: VecDeque<(Vec<String>, bool)>,
    pub log: Arc<Mutex<Vec<String>>>,
    fail_next: bool,
    first_turn: bool,
}

impl ReplayModel {
    pub fn new(replies: Vec<(Vec<&str>, bool)>) -> Self {
        Self {
            replies: replies
                .into_iter()
                .map(|(f, native)| (f.into_iter().map(String::from).collect(), native))
                .collect(),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_next: false,
            first_turn: true,
        }
    }

    /// The first `generate` call fails outright.
    pub fn failing() -> Self {
        let mut model = Self::new(vec![]);
        model.fail_next = true;
        model
    }
}

pub struct ReplayStream {
    fragments: VecDeque<String>,
    native_stop: bool,
    exhausted: bool,
}

impl Iterator for ReplayStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.fragments.pop_front();
        if next.is_none() {
            self.exhausted = true;
        }
        next.map(Ok)
    }
}

impl FragmentStream for ReplayStream {
    fn finish_reason(&self) -> Option<FinishReason> {
        (self.exhausted && self.native_stop).then_some(FinishReason::EndOfTurn)
    }
}

impl LanguageModel for ReplayModel {
    fn is_first_turn(&self) -> bool {
        self.first_turn
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &str,
        _max_fragments: usize,
    ) -> Result<Box<dyn FragmentStream + 'a>> {
        self.first_turn = false;
        self.log.lock().push(prompt.to_string());
        if std::mem::take(&mut self.fail_next) {
            return Err(ParleyError::Generation("model crashed".into()));
        }
        let (fragments, native_stop) = self.replies.pop_front().unwrap_or_default();
        Ok(Box::new(ReplayStream {
            fragments: fragments.into(),
            native_stop,
            exhausted: false,
        }))
    }

    fn append_to_context(&mut self, text: &str) -> Result<()> {
        self.log.lock().push(text.to_string());
        Ok(())
    }
}
