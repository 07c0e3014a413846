//! Events published by the conversation loop.
//!
//! Delivered on a `tokio::sync::broadcast` channel; see
//! `ConversationLoop::subscribe`. Every event serialises to one JSON object
//! with a `"type"` tag, which is what `parley --json-events` prints.

use serde::{Deserialize, Serialize};

use crate::inference::FinishReason;

// ---------------------------------------------------------------------------
// Turn state
// ---------------------------------------------------------------------------

/// Where the conversation loop is in the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Waiting for the begin signal.
    Idle,
    /// Capturing audio until the end signal.
    Recording,
    /// Recognising the captured audio.
    Transcribing,
    /// Generation running, nothing queued for speech yet.
    Generating,
    /// At least one phrase queued; generation may still be running.
    Speaking,
    /// Generation done, waiting for queued audio to play out.
    Draining,
}

/// Why generation for a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// The model ended its own turn.
    ModelEndOfTurn,
    /// A stop marker showed up in the text; the context was closed for it.
    TextMarker,
    /// The fragment budget ran out.
    MaxFragments,
    /// The stream ended without any end signal.
    StreamEnded,
    /// The model call failed part way.
    GenerationFailed,
}

impl StopReason {
    /// Whether the model's context was left open and needs an explicit
    /// end marker before the next prompt.
    pub fn needs_context_close(self) -> bool {
        !matches!(self, StopReason::ModelEndOfTurn)
    }

    pub(crate) fn from_finish(finish: Option<FinishReason>, marker_seen: bool) -> Self {
        match (finish, marker_seen) {
            (Some(FinishReason::EndOfTurn), _) => StopReason::ModelEndOfTurn,
            (_, true) => StopReason::TextMarker,
            (Some(FinishReason::MaxFragments), false) => StopReason::MaxFragments,
            (None, false) => StopReason::StreamEnded,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConversationEvent {
    State {
        state: TurnState,
    },
    /// A recording finished.
    Recorded {
        samples: usize,
        seconds: f64,
        dropped_frames: u64,
    },
    Transcript {
        text: String,
    },
    /// Filtered reply text, in arrival order, markers removed.
    ReplyText {
        text: String,
    },
    /// A phrase handed to synthesis.
    Phrase {
        index: usize,
        text: String,
    },
    TurnFinished {
        turn: u64,
        chunks: usize,
        stop: StopReason,
    },
    /// A soft failure the user should hear about.
    Notice {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serializes_with_type_tag_and_lowercase_state() {
        let event = ConversationEvent::State {
            state: TurnState::Transcribing,
        };
        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"], "transcribing");

        let round_trip: ConversationEvent =
            serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn recorded_event_uses_camel_case_fields() {
        let event = ConversationEvent::Recorded {
            samples: 16_000,
            seconds: 1.0,
            dropped_frames: 2,
        };
        let json = serde_json::to_value(&event).expect("serialize recorded event");
        assert_eq!(json["type"], "recorded");
        assert_eq!(json["droppedFrames"], 2);
        assert_eq!(json["samples"], 16_000);
    }

    #[test]
    fn turn_finished_serializes_stop_reason() {
        let event = ConversationEvent::TurnFinished {
            turn: 3,
            chunks: 2,
            stop: StopReason::TextMarker,
        };
        let json = serde_json::to_value(&event).expect("serialize turn event");
        assert_eq!(json["type"], "turnFinished");
        assert_eq!(json["stop"], "textMarker");
    }

    #[test]
    fn turn_state_rejects_wrong_casing() {
        let err = serde_json::from_str::<TurnState>(r#""Idle""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn only_native_end_leaves_context_closed() {
        assert_eq!(
            StopReason::from_finish(Some(FinishReason::EndOfTurn), true),
            StopReason::ModelEndOfTurn
        );
        assert_eq!(
            StopReason::from_finish(Some(FinishReason::MaxFragments), true),
            StopReason::TextMarker
        );
        assert_eq!(
            StopReason::from_finish(None, false),
            StopReason::StreamEnded
        );
        assert!(!StopReason::ModelEndOfTurn.needs_context_close());
        assert!(StopReason::TextMarker.needs_context_close());
        assert!(StopReason::MaxFragments.needs_context_close());
        assert!(StopReason::GenerationFailed.needs_context_close());
    }
}
