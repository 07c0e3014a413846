//! Stub engines that run the full conversation loop without model files.
//!
//! - `StubRecognizer` returns scripted transcripts, then a sample-count echo.
//! - `StubModel` streams scripted replies fragment by fragment, then echoes
//!   the user's words back.
//! - `ToneSynthesizer` renders one short tone per word.

use std::collections::VecDeque;
use std::f32::consts::TAU;

use tracing::debug;

use crate::buffering::chunk::Recording;
use crate::error::Result;
use crate::inference::{
    FinishReason, FragmentStream, LanguageModel, RenderedAudio, SpeechRecognizer,
    SpeechSynthesizer,
};

const USER_OPEN: &str = "<|im_start|>user\n";
const TURN_CLOSE: &str = "<|im_end|>";

#[derive(Debug, Default)]
pub struct StubRecognizer {
    scripted: VecDeque<String>,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcripts returned in order before falling back to the echo.
    pub fn scripted<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripted: transcripts.into_iter().map(Into::into).collect(),
        }
    }
}

impl SpeechRecognizer for StubRecognizer {
    fn warm_up(&mut self) -> Result<()> {
        debug!("stub recognizer warm-up is a no-op");
        Ok(())
    }

    fn transcribe(&mut self, recording: &Recording) -> Result<String> {
        if let Some(text) = self.scripted.pop_front() {
            return Ok(text);
        }
        Ok(format!(
            "[stub: {} samples @ {} Hz]",
            recording.samples.len(),
            recording.sample_rate
        ))
    }
}

/// One canned reply for `StubModel`.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub fragments: Vec<String>,
    /// End with the model's own end-of-turn signal once fragments run out.
    pub native_stop: bool,
}

impl ScriptedReply {
    pub fn new<I, S>(fragments: I, native_stop: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            native_stop,
        }
    }
}

#[derive(Debug, Default)]
pub struct StubModel {
    replies: VecDeque<ScriptedReply>,
    context: Vec<String>,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I: IntoIterator<Item = ScriptedReply>>(replies: I) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            context: Vec::new(),
        }
    }

    /// Everything fed into the running context, in order.
    pub fn context(&self) -> &[String] {
        &self.context
    }

    fn echo_reply(prompt: &str) -> ScriptedReply {
        let heard = prompt
            .rfind(USER_OPEN)
            .map(|start| &prompt[start + USER_OPEN.len()..])
            .map(|rest| rest.split(TURN_CLOSE).next().unwrap_or(rest))
            .unwrap_or(prompt)
            .trim();
        let reply = format!("You said: {heard}. What next?");
        ScriptedReply::new(reply.split_inclusive(' ').map(str::to_string), true)
    }
}

impl LanguageModel for StubModel {
    fn is_first_turn(&self) -> bool {
        self.context.is_empty()
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &str,
        max_fragments: usize,
    ) -> Result<Box<dyn FragmentStream + 'a>> {
        self.context.push(prompt.to_string());
        let reply = self
            .replies
            .pop_front()
            .unwrap_or_else(|| Self::echo_reply(prompt));
        Ok(Box::new(StubStream {
            context: &mut self.context,
            fragments: reply.fragments.into(),
            native_stop: reply.native_stop,
            remaining: max_fragments,
            finish: None,
            done: false,
        }))
    }

    fn append_to_context(&mut self, text: &str) -> Result<()> {
        self.context.push(text.to_string());
        Ok(())
    }
}

struct StubStream<'a> {
    context: &'a mut Vec<String>,
    fragments: VecDeque<String>,
    native_stop: bool,
    remaining: usize,
    finish: Option<FinishReason>,
    done: bool,
}

impl Iterator for StubStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.remaining == 0 {
            self.done = true;
            self.finish = Some(FinishReason::MaxFragments);
            return None;
        }
        match self.fragments.pop_front() {
            Some(fragment) => {
                self.remaining -= 1;
                self.context.push(fragment.clone());
                Some(Ok(fragment))
            }
            None => {
                self.done = true;
                self.finish = self.native_stop.then_some(FinishReason::EndOfTurn);
                None
            }
        }
    }
}

impl FragmentStream for StubStream<'_> {
    fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }
}

/// Renders a short sine tone per word, with a gap between words.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    sample_rate: u32,
}

impl ToneSynthesizer {
    const WORD_SECS: f32 = 0.12;
    const GAP_SECS: f32 = 0.04;
    const FADE_SECS: f32 = 0.005;
    const AMPLITUDE: f32 = 0.2;

    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self::new(22_050)
    }
}

impl SpeechSynthesizer for ToneSynthesizer {
    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn render(&mut self, text: &str, speed: f32) -> Result<RenderedAudio> {
        let rate = self.sample_rate as f32;
        let speed = speed.clamp(0.25, 4.0);
        let word_len = (Self::WORD_SECS / speed * rate).round() as usize;
        let gap_len = (Self::GAP_SECS / speed * rate).round() as usize;
        let fade_len = ((Self::FADE_SECS * rate).round() as usize).max(1);

        let mut samples = Vec::new();
        for word in text.split_whitespace() {
            let freq = 220.0 + 40.0 * (word.chars().count() % 8) as f32;
            for i in 0..word_len {
                let edge = i.min(word_len - 1 - i);
                let envelope = (edge as f32 / fade_len as f32).min(1.0);
                let phase = TAU * freq * i as f32 / rate;
                samples.push(Self::AMPLITUDE * envelope * phase.sin());
            }
            samples.extend(std::iter::repeat(0.0).take(gap_len));
        }
        Ok(RenderedAudio::new(samples, self.sample_rate))
    }
}
