//! # parley-core
//!
//! Streaming voice-conversation engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CpalCapture → SPSC ring → TurnRecorder (drain thread, 16 kHz)
//!                                              │
//!                                   SpeechRecognizer::transcribe
//!                                              │
//!                             LanguageModel::generate (FragmentStream)
//!                                              │
//!                                    TokenStreamSegmenter
//!                                              │ PhraseChunk
//!                                    SynthesisStreamer worker
//!                                              │ rendered audio
//!                              PlaybackCursor → CpalPlayback → Speaker
//! ```
//!
//! `ConversationLoop` sequences the stages and publishes
//! `ConversationEvent`s on a broadcast channel. Audio callbacks never block
//! and never wait on a lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod recorder;
pub mod segmenter;
pub mod synthesis;

// Convenience re-exports for downstream crates
pub use audio::{CpalCapture, CpalPlayback};
pub use buffering::chunk::Recording;
pub use engine::{
    ConversationConfig, ConversationLoop, Engines, SessionSummary, TurnOutcome, TurnSummary,
    TurnTrigger,
};
pub use error::{ParleyError, Result};
pub use inference::{
    FinishReason, FragmentStream, LanguageModel, RenderedAudio, SpeechRecognizer,
    SpeechSynthesizer, SynthHandle,
};
pub use ipc::events::{ConversationEvent, StopReason, TurnState};
pub use recorder::{RecorderConfig, TurnRecorder};
pub use segmenter::{PhraseChunk, SegmenterConfig, TokenStreamSegmenter};
pub use synthesis::{StreamReport, SynthesisConfig, SynthesisStreamer};
