//! Engine capabilities.
//!
//! Recognition, generation and synthesis are black boxes behind these
//! traits. Each engine is a single-owner object handed to the conversation
//! loop at construction; nothing here is global.
//!
//! `&mut self` on the heavy calls expresses that engines are stateful
//! (decoder caches, running LLM context). The synthesizer is the only engine
//! used off the control thread, so it alone sits behind a
//! `parking_lot::Mutex` in [`SynthHandle`].

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::Recording;
use crate::error::Result;

/// Contract for speech recognition backends.
pub trait SpeechRecognizer {
    /// One-time warm-up: load weights, run a dummy pass. Default: no-op.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Transcribe a mono 16 kHz recording into text.
    fn transcribe(&mut self, recording: &Recording) -> Result<String>;
}

/// Why a fragment stream ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// The model produced its own end-of-turn token.
    EndOfTurn,
    /// The fragment budget ran out first.
    MaxFragments,
}

/// Lazy, in-order, finite sequence of generated text fragments.
///
/// Not restartable. Once the iterator returns `None`, `finish_reason`
/// reports why.
pub trait FragmentStream: Iterator<Item = Result<String>> {
    fn finish_reason(&self) -> Option<FinishReason>;
}

/// Contract for language-model backends with a running context.
pub trait LanguageModel {
    /// True until the first prompt has been fed into the context.
    fn is_first_turn(&self) -> bool;

    /// Feed `prompt` and stream at most `max_fragments` fragments back.
    fn generate<'a>(
        &'a mut self,
        prompt: &str,
        max_fragments: usize,
    ) -> Result<Box<dyn FragmentStream + 'a>>;

    /// Extend the running context without producing output.
    fn append_to_context(&mut self, text: &str) -> Result<()>;
}

/// Mono PCM rendered for exactly one phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl RenderedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Contract for speech synthesis backends.
pub trait SpeechSynthesizer: Send + 'static {
    /// Rate every `render` result is produced at.
    fn native_sample_rate(&self) -> u32;

    /// Render `text` at `speed` (1.0 = natural pace).
    fn render(&mut self, text: &str, speed: f32) -> Result<RenderedAudio>;
}

/// Thread-safe reference-counted handle to any `SpeechSynthesizer`.
#[derive(Clone)]
pub struct SynthHandle(pub Arc<Mutex<dyn SpeechSynthesizer>>);

impl SynthHandle {
    pub fn new<S: SpeechSynthesizer>(synth: S) -> Self {
        Self(Arc::new(Mutex::new(synth)))
    }

    pub fn native_sample_rate(&self) -> u32 {
        self.0.lock().native_sample_rate()
    }
}

impl std::fmt::Debug for SynthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthHandle").finish_non_exhaustive()
    }
}
