//! `ConversationLoop`: the turn-taking state machine.
//!
//! ## Turn lifecycle
//!
//! ```text
//! Idle ──begin_turn()──► Recording ──end_turn()──► Transcribing
//!                                                     │
//!                      exit phrase ◄──────────────────┤ (session over)
//!                                                     ▼
//!                                                 Generating ──first phrase──► Speaking
//!                                                     │                           │
//!                                                     └───── stream ended ────────┤
//!                                                                                 ▼
//!                                             Idle ◄──audio played── Draining
//! ```
//!
//! Generation and playback overlap: phrases are handed to the
//! [`SynthesisStreamer`] as the segmenter cuts them, so the first sentence is
//! audible while the model is still producing the rest.
//!
//! ## Errors
//!
//! Device errors are fatal and leave `run` with `Err`. Engine failures, too
//! little audio and ring overflow are reported as events and the loop goes
//! back to `Idle`.

pub mod prompt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::{
    buffering::chunk::Recording,
    error::{ParleyError, Result},
    inference::{LanguageModel, SpeechRecognizer, SynthHandle},
    ipc::events::{ConversationEvent, StopReason, TurnState},
    recorder::{CaptureBackend, RecorderConfig, TurnRecorder},
    segmenter::{PhraseChunk, SegmentOutput, SegmenterConfig, TokenStreamSegmenter},
    synthesis::{PlaybackBackend, StreamReport, SynthesisConfig, SynthesisStreamer},
};

use prompt::{build_prompt, is_exit_phrase, CONTEXT_CLOSE};

/// Broadcast channel capacity: events buffered for slow subscribers.
const EVENT_CAP: usize = 256;

/// Configuration for `ConversationLoop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ConversationConfig {
    pub recorder: RecorderConfig,
    pub segmenter: SegmenterConfig,
    pub synthesis: SynthesisConfig,
    /// Any of these inside a transcript ends the session.
    pub exit_phrases: Vec<String>,
    /// System prompt sent with the first turn only.
    pub system_preamble: String,
    /// Fragment budget per reply. Default: 32768.
    pub max_fragments: usize,
    /// Spoken in place of a reply when generation fails.
    pub generation_failure_text: String,
    /// Prefix of the notice shown when recognition fails.
    pub recognition_failure_text: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig::default(),
            segmenter: SegmenterConfig::default(),
            synthesis: SynthesisConfig::default(),
            exit_phrases: vec!["quit".into(), "exit".into(), "goodbye".into()],
            system_preamble: "You are Parley, a voice assistant. Keep a friendly, casual tone \
                              and answer in a few short sentences. No emojis or special characters."
                .into(),
            max_fragments: 32_768,
            generation_failure_text: "Sorry, I lost my train of thought.".into(),
            recognition_failure_text: "Could not understand the recording".into(),
        }
    }
}

/// Begin/end signals from whoever drives the loop (a key press, a button).
pub trait TurnTrigger {
    /// Block until the user wants to speak. `false` ends the session.
    fn wait_for_begin(&mut self) -> bool;

    /// Block until the user has finished speaking.
    fn wait_for_end(&mut self);
}

/// The recognition, generation and synthesis engines a loop owns.
pub struct Engines {
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub model: Box<dyn LanguageModel>,
    pub synthesizer: SynthHandle,
}

/// One completed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub turn: u64,
    pub transcript: String,
    /// Filtered reply text as displayed.
    pub reply: String,
    pub chunks: usize,
    pub stop: StopReason,
    pub stream: StreamReport,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(TurnSummary),
    /// Less audio than `min_recording_samples`; recognition was not run.
    TooShort { samples: usize },
    /// Recognition returned no text.
    NothingRecognized,
    RecognitionFailed(String),
    /// The transcript held an exit phrase; the session is over.
    Exit { transcript: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub turns: u64,
    pub replies: usize,
    pub exit_transcript: Option<String>,
}

impl SessionSummary {
    fn record(&mut self, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Completed(_) => self.replies += 1,
            TurnOutcome::Exit { transcript } => self.exit_transcript = Some(transcript.clone()),
            _ => {}
        }
    }
}

pub struct ConversationLoop {
    config: ConversationConfig,
    recorder: TurnRecorder,
    recognizer: Box<dyn SpeechRecognizer>,
    model: Box<dyn LanguageModel>,
    streamer: SynthesisStreamer,
    events: broadcast::Sender<ConversationEvent>,
    state: TurnState,
    turns: u64,
    terminated: bool,
    recording_observer: Option<Box<dyn FnMut(&Recording)>>,
}

impl ConversationLoop {
    /// Open the playback device and take ownership of the engines. The
    /// capture device is only opened while a turn is recording.
    ///
    /// # Errors
    /// Playback device errors (fatal).
    pub fn new(
        config: ConversationConfig,
        engines: Engines,
        capture: Box<dyn CaptureBackend>,
        playback: &mut dyn PlaybackBackend,
    ) -> Result<Self> {
        let streamer =
            SynthesisStreamer::open(engines.synthesizer, playback, config.synthesis.clone())?;
        let recorder = TurnRecorder::new(capture, config.recorder.clone());
        let (events, _) = broadcast::channel(EVENT_CAP);

        Ok(Self {
            config,
            recorder,
            recognizer: engines.recognizer,
            model: engines.model,
            streamer,
            events,
            state: TurnState::Idle,
            turns: 0,
            terminated: false,
            recording_observer: None,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn streamer(&self) -> &SynthesisStreamer {
        &self.streamer
    }

    /// Called with every recording before it is recognised.
    pub fn set_recording_observer(&mut self, observer: impl FnMut(&Recording) + 'static) {
        self.recording_observer = Some(Box::new(observer));
    }

    /// Warm up the recognizer. Call once before the first turn.
    pub fn warm_up(&mut self) -> Result<()> {
        info!("warming up speech recognizer");
        self.recognizer.warm_up()
    }

    /// Drive turns until an exit phrase, a fatal error, or the trigger
    /// declines to begin another turn.
    pub fn run(&mut self, trigger: &mut dyn TurnTrigger) -> Result<SessionSummary> {
        let mut summary = SessionSummary::default();

        while !self.terminated {
            if !trigger.wait_for_begin() {
                info!("trigger closed; ending session");
                break;
            }
            if let Err(e) = self.begin_turn() {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(error = %e, "could not start turn");
                self.notice(e.to_string());
                continue;
            }

            trigger.wait_for_end();
            match self.end_turn() {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "turn failed");
                    self.notice(e.to_string());
                }
            }
        }

        summary.turns = self.turns;
        info!(turns = summary.turns, replies = summary.replies, "session ended");
        Ok(summary)
    }

    /// `Idle → Recording`.
    ///
    /// # Errors
    /// - `SessionTerminated` after an exit phrase.
    /// - `AlreadyRecording` when not idle.
    /// - Capture device errors (fatal).
    pub fn begin_turn(&mut self) -> Result<()> {
        if self.terminated {
            return Err(ParleyError::SessionTerminated);
        }
        if self.state != TurnState::Idle {
            return Err(ParleyError::AlreadyRecording);
        }
        self.turns += 1;
        let span = info_span!("turn", turn = self.turns);
        let _guard = span.enter();

        self.recorder.start()?;
        self.set_state(TurnState::Recording);
        Ok(())
    }

    /// `Recording → Transcribing → …`. Stops capture and runs the rest of
    /// the turn to completion.
    pub fn end_turn(&mut self) -> Result<TurnOutcome> {
        if self.state != TurnState::Recording {
            return Err(ParleyError::NotRecording);
        }
        let span = info_span!("turn", turn = self.turns);
        let _guard = span.enter();

        let recording = match self.recorder.stop() {
            Ok(r) => r,
            Err(e) => {
                self.set_state(TurnState::Idle);
                return Err(e);
            }
        };
        self.handle_recording(recording)
    }

    /// Run a finished recording through recognition and, unless it is too
    /// short, empty or an exit phrase, through a full reply.
    pub fn handle_recording(&mut self, recording: Recording) -> Result<TurnOutcome> {
        if self.terminated {
            return Err(ParleyError::SessionTerminated);
        }
        if self.state == TurnState::Idle {
            self.turns += 1;
        }
        let span = info_span!("turn", turn = self.turns);
        let _guard = span.enter();

        self.emit(ConversationEvent::Recorded {
            samples: recording.len(),
            seconds: recording.duration_secs(),
            dropped_frames: recording.dropped_frames,
        });
        info!(
            seconds = format_args!("{:.2}", recording.duration_secs()),
            "captured audio"
        );
        if let Some(observer) = self.recording_observer.as_mut() {
            observer(&recording);
        }

        if recording.len() < self.config.recorder.min_recording_samples {
            let insufficient = ParleyError::InsufficientInput {
                samples: recording.len(),
                required: self.config.recorder.min_recording_samples,
            };
            info!("{insufficient}");
            self.notice(insufficient.to_string());
            self.set_state(TurnState::Idle);
            return Ok(TurnOutcome::TooShort {
                samples: recording.len(),
            });
        }

        self.set_state(TurnState::Transcribing);
        let transcript = match self.recognizer.transcribe(&recording) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "recognition failed");
                let message = format!("{}: {e}", self.config.recognition_failure_text);
                self.notice(message.clone());
                self.set_state(TurnState::Idle);
                return Ok(TurnOutcome::RecognitionFailed(message));
            }
        };

        if transcript.is_empty() {
            self.notice("Nothing recognised.".into());
            self.set_state(TurnState::Idle);
            return Ok(TurnOutcome::NothingRecognized);
        }
        info!(text = %transcript, "transcript");
        self.emit(ConversationEvent::Transcript {
            text: transcript.clone(),
        });

        if is_exit_phrase(&transcript, &self.config.exit_phrases) {
            info!("exit phrase heard; ending session");
            self.terminated = true;
            self.set_state(TurnState::Idle);
            return Ok(TurnOutcome::Exit { transcript });
        }

        self.respond_to_text(&transcript).map(TurnOutcome::Completed)
    }

    /// `Generating → Speaking → Draining → Idle` for one user message.
    pub fn respond_to_text(&mut self, transcript: &str) -> Result<TurnSummary> {
        if self.terminated {
            return Err(ParleyError::SessionTerminated);
        }
        if self.state == TurnState::Idle {
            self.turns += 1;
        }
        let span = info_span!("turn", turn = self.turns);
        let _guard = span.enter();

        let result = self.stream_reply(transcript);
        if result.is_err() {
            self.streamer.finish();
            self.set_state(TurnState::Idle);
        }
        result
    }

    fn stream_reply(&mut self, transcript: &str) -> Result<TurnSummary> {
        let preamble = self
            .model
            .is_first_turn()
            .then_some(self.config.system_preamble.as_str());
        let prompt = build_prompt(preamble, transcript);
        debug!(prompt_len = prompt.len(), first_turn = preamble.is_some(), "prompt built");

        self.set_state(TurnState::Generating);

        let mut segmenter = TokenStreamSegmenter::new(self.config.segmenter.clone());
        let Self {
            model,
            streamer,
            events,
            state,
            config,
            ..
        } = self;
        let mut sink = TurnSink {
            streamer,
            events,
            state,
            reply: String::new(),
            chunks: 0,
        };

        let mut failure: Option<ParleyError> = None;
        let mut finish = None;
        match model.generate(&prompt, config.max_fragments) {
            Ok(mut stream) => {
                for fragment in stream.by_ref() {
                    match fragment {
                        Ok(text) => {
                            sink.accept(segmenter.push(&text))?;
                            if segmenter.stop_observed() {
                                break;
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                finish = stream.finish_reason();
            }
            Err(e) => failure = Some(e),
        }
        sink.accept(segmenter.finish())?;

        let stop = if let Some(e) = &failure {
            warn!(error = %e, "generation failed");
            let chunk = PhraseChunk {
                index: segmenter.emitted(),
                text: config.generation_failure_text.clone(),
                is_final: true,
            };
            sink.accept(SegmentOutput {
                display: chunk.text.clone(),
                chunks: vec![chunk],
            })?;
            StopReason::GenerationFailed
        } else {
            StopReason::from_finish(finish, segmenter.stop_observed())
        };
        if let Some(marker) = segmenter.matched_marker() {
            debug!(marker, "stop marker matched in text");
        }

        if stop.needs_context_close() {
            if let Err(e) = model.append_to_context(CONTEXT_CLOSE) {
                warn!(error = %e, "could not close the model context");
            }
        }

        let TurnSink { reply, chunks, .. } = sink;
        self.set_state(TurnState::Draining);
        let stream = self.streamer.finish();
        self.set_state(TurnState::Idle);

        self.emit(ConversationEvent::TurnFinished {
            turn: self.turns,
            chunks,
            stop,
        });
        info!(chunks, ?stop, "turn finished");

        Ok(TurnSummary {
            turn: self.turns,
            transcript: transcript.to_string(),
            reply,
            chunks,
            stop,
            stream,
        })
    }

    fn set_state(&mut self, next: TurnState) {
        set_state(&mut self.state, &self.events, next);
    }

    fn notice(&self, message: String) {
        self.emit(ConversationEvent::Notice { message });
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn set_state(
    state: &mut TurnState,
    events: &broadcast::Sender<ConversationEvent>,
    next: TurnState,
) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "turn state");
        *state = next;
        let _ = events.send(ConversationEvent::State { state: next });
    }
}

/// Where segmenter output goes while the model is still streaming.
struct TurnSink<'a> {
    streamer: &'a mut SynthesisStreamer,
    events: &'a broadcast::Sender<ConversationEvent>,
    state: &'a mut TurnState,
    reply: String,
    chunks: usize,
}

impl TurnSink<'_> {
    fn accept(&mut self, out: SegmentOutput) -> Result<()> {
        if !out.display.is_empty() {
            self.reply.push_str(&out.display);
            let _ = self.events.send(ConversationEvent::ReplyText { text: out.display });
        }
        for chunk in out.chunks {
            let _ = self.events.send(ConversationEvent::Phrase {
                index: chunk.index,
                text: chunk.text.clone(),
            });
            self.streamer.queue(chunk)?;
            self.chunks += 1;
            set_state(self.state, self.events, TurnState::Speaking);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::{ScriptedReply, StubModel, StubRecognizer, ToneSynthesizer};
    use crate::recorder::CaptureHandle;
    use crate::buffering::CaptureWriter;
    use crate::synthesis::{PlaybackCursor, PlaybackHandle};

    struct NoCapture;

    impl CaptureBackend for NoCapture {
        fn open(&mut self, _writer: CaptureWriter) -> Result<Box<dyn CaptureHandle>> {
            Err(ParleyError::NoDefaultInputDevice)
        }
    }

    /// Plays instantly: every fill drains whatever is queued.
    struct InstantPlayback;

    struct InstantHandle {
        rate: u32,
        running: std::sync::Arc<std::sync::atomic::AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl PlaybackBackend for InstantPlayback {
        fn open(
            &mut self,
            sample_rate: u32,
            mut cursor: PlaybackCursor,
        ) -> Result<Box<dyn PlaybackHandle>> {
            use std::sync::atomic::{AtomicBool, Ordering};
            let running = std::sync::Arc::new(AtomicBool::new(true));
            let flag = std::sync::Arc::clone(&running);
            let thread = std::thread::spawn(move || {
                let mut block = vec![0.0f32; 4_096];
                while flag.load(Ordering::Acquire) {
                    cursor.fill(&mut block);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            });
            Ok(Box::new(InstantHandle {
                rate: sample_rate,
                running,
                thread: Some(thread),
            }))
        }
    }

    impl PlaybackHandle for InstantHandle {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn stop(&mut self) {
            self.running
                .store(false, std::sync::atomic::Ordering::Release);
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
        }
    }

    fn conversation(transcripts: &[&str], replies: Vec<ScriptedReply>) -> ConversationLoop {
        let engines = Engines {
            recognizer: Box::new(StubRecognizer::scripted(transcripts.iter().copied())),
            model: Box::new(StubModel::scripted(replies)),
            synthesizer: SynthHandle::new(ToneSynthesizer::new(8_000)),
        };
        ConversationLoop::new(
            ConversationConfig::default(),
            engines,
            Box::new(NoCapture),
            &mut InstantPlayback,
        )
        .unwrap()
    }

    fn speech() -> Recording {
        Recording::new(vec![0.0; 3_200], 16_000)
    }

    #[test]
    fn too_short_recording_skips_recognition() {
        let mut convo = conversation(&["should not be used"], vec![]);
        let outcome = convo
            .handle_recording(Recording::new(vec![0.0; 100], 16_000))
            .unwrap();
        assert_eq!(outcome, TurnOutcome::TooShort { samples: 100 });
        assert_eq!(convo.state(), TurnState::Idle);
        assert!(!convo.is_terminated());
    }

    #[test]
    fn exit_phrase_terminates_without_speaking() {
        let mut convo = conversation(&["okay quit now"], vec![]);
        let outcome = convo.handle_recording(speech()).unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Exit {
                transcript: "okay quit now".into()
            }
        );
        assert!(convo.is_terminated());
        assert_eq!(convo.streamer().worker_spawns(), 0);
        assert!(matches!(
            convo.begin_turn(),
            Err(ParleyError::SessionTerminated)
        ));
    }

    #[test]
    fn empty_transcript_is_nothing_recognized() {
        let mut convo = conversation(&["   "], vec![]);
        let outcome = convo.handle_recording(speech()).unwrap();
        assert_eq!(outcome, TurnOutcome::NothingRecognized);
        assert_eq!(convo.state(), TurnState::Idle);
    }

    #[test]
    fn capture_device_failure_is_fatal() {
        let mut convo = conversation(&[], vec![]);
        let err = convo.begin_turn().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(convo.state(), TurnState::Idle);
    }

    #[test]
    fn reply_is_filtered_and_phrased() {
        let mut convo = conversation(
            &[],
            vec![ScriptedReply::new(
                ["Hello there", ". How are", " you?<|im_", "end|> ignored"],
                false,
            )],
        );
        let summary = convo.respond_to_text("hi").unwrap();
        assert_eq!(summary.reply, "Hello there. How are you?");
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.stop, StopReason::TextMarker);
        assert_eq!(summary.stream.chunks_rendered, 2);
        assert!(summary.stream.drained);
        assert_eq!(convo.state(), TurnState::Idle);
    }
}
