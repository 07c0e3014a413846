//! Whole-session behaviour of `ConversationLoop` with fake devices.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_core::inference::stub::StubRecognizer;
use parley_core::{
    ConversationConfig, ConversationEvent, ConversationLoop, Engines, StopReason, SynthHandle,
    TurnOutcome, TurnState, TurnTrigger,
};
use support::{BurstCapture, LabelSynth, PacedPlayback, ReplayModel};
use tokio::sync::broadcast::{error::TryRecvError, Receiver};

/// Presses "begin" a fixed number of times; "end" returns immediately.
struct Presses(usize);

impl TurnTrigger for Presses {
    fn wait_for_begin(&mut self) -> bool {
        if self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        true
    }

    fn wait_for_end(&mut self) {}
}

struct Harness {
    convo: ConversationLoop,
    events: Receiver<ConversationEvent>,
    model_log: Arc<Mutex<Vec<String>>>,
}

fn harness(transcripts: &[&str], model: ReplayModel, capture_frames: usize) -> Harness {
    let model_log = model.log.clone();
    let engines = Engines {
        recognizer: Box::new(StubRecognizer::scripted(transcripts.iter().copied())),
        model: Box::new(model),
        synthesizer: SynthHandle::new(LabelSynth::new(8_000, 80, vec![])),
    };
    let convo = ConversationLoop::new(
        ConversationConfig::default(),
        engines,
        Box::new(BurstCapture {
            frames: capture_frames,
            rate: 16_000,
        }),
        &mut PacedPlayback::instant(),
    )
    .unwrap();
    let events = convo.subscribe();
    Harness {
        convo,
        events,
        model_log,
    }
}

fn drain_events(rx: &mut Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

fn states(events: &[ConversationEvent]) -> Vec<TurnState> {
    events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::State { state } => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
fn immediate_exit_phrase_ends_session_without_speaking() {
    let mut h = harness(&["okay quit now"], ReplayModel::new(vec![]), 3_200);
    let started = Instant::now();
    let summary = h.convo.run(&mut Presses(5)).unwrap();

    assert_eq!(summary.turns, 1);
    assert_eq!(summary.replies, 0);
    assert_eq!(summary.exit_transcript.as_deref(), Some("okay quit now"));
    assert!(h.convo.is_terminated());
    assert_eq!(h.convo.streamer().worker_spawns(), 0);
    assert!(h.model_log.lock().is_empty(), "generation must not run");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn full_turn_moves_through_every_state_in_order() {
    let model = ReplayModel::new(vec![(vec!["1 Hello there.", " 2 How are", " you?"], true)]);
    let mut h = harness(&["hi there"], model, 3_200);
    h.convo.begin_turn().unwrap();
    let outcome = h.convo.end_turn().unwrap();

    let TurnOutcome::Completed(summary) = outcome else {
        panic!("expected a completed turn, got {outcome:?}");
    };
    assert_eq!(summary.reply, "1 Hello there. 2 How are you?");
    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.stop, StopReason::ModelEndOfTurn);
    assert_eq!(summary.stream.chunks_rendered, 2);

    let events = drain_events(&mut h.events);
    assert_eq!(
        states(&events),
        vec![
            TurnState::Recording,
            TurnState::Transcribing,
            TurnState::Generating,
            TurnState::Speaking,
            TurnState::Draining,
            TurnState::Idle,
        ]
    );

    let phrases: Vec<(usize, String)> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::Phrase { index, text } => Some((*index, text.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        phrases,
        vec![
            (0, "1 Hello there.".to_string()),
            (1, "2 How are you?".to_string())
        ]
    );

    let recorded = events.iter().find_map(|e| match e {
        ConversationEvent::Recorded { samples, .. } => Some(*samples),
        _ => None,
    });
    assert_eq!(recorded, Some(3_200));
    assert!(matches!(
        events.last(),
        Some(ConversationEvent::TurnFinished { turn: 1, chunks: 2, .. })
    ));
}

#[test]
fn text_marker_closes_context_but_native_stop_does_not() {
    let model = ReplayModel::new(vec![
        (vec!["1 Sure.", "<|im_end|>", "<|im_start|>user\nfake"], false),
        (vec!["2 Again."], true),
    ]);
    let mut h = harness(&[], model, 0);

    let first = h.convo.respond_to_text("first").unwrap();
    assert_eq!(first.stop, StopReason::TextMarker);
    assert_eq!(first.reply, "1 Sure.");
    let second = h.convo.respond_to_text("second").unwrap();
    assert_eq!(second.stop, StopReason::ModelEndOfTurn);

    let log = h.model_log.lock().clone();
    assert_eq!(log.len(), 3, "prompt, close, prompt: {log:?}");
    assert!(log[0].starts_with("<|im_start|>system\n"));
    assert!(log[0].ends_with("<|im_start|>user\nfirst<|im_end|>\n<|im_start|>assistant\n"));
    assert_eq!(log[1], "<|im_end|>\n");
    assert_eq!(
        log[2],
        "<|im_start|>user\nsecond<|im_end|>\n<|im_start|>assistant\n"
    );
}

#[test]
fn too_short_capture_returns_to_idle_without_recognition() {
    let mut h = harness(&["should stay unused"], ReplayModel::new(vec![]), 400);
    h.convo.begin_turn().unwrap();
    let outcome = h.convo.end_turn().unwrap();
    assert_eq!(outcome, TurnOutcome::TooShort { samples: 400 });
    assert_eq!(h.convo.state(), TurnState::Idle);

    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConversationEvent::Notice { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ConversationEvent::Transcript { .. })));
}

#[test]
fn generation_failure_speaks_fallback_and_keeps_session_alive() {
    let mut h = harness(&["tell me something"], ReplayModel::failing(), 3_200);
    let summary = h.convo.run(&mut Presses(1)).unwrap();
    assert_eq!(summary.replies, 1);
    assert!(!h.convo.is_terminated());
    assert_eq!(h.convo.state(), TurnState::Idle);

    let events = drain_events(&mut h.events);
    let fallback = ConversationConfig::default().generation_failure_text;
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::Phrase { text, .. } if *text == fallback
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::TurnFinished {
            stop: StopReason::GenerationFailed,
            ..
        }
    )));
    assert_eq!(h.model_log.lock().last().map(String::as_str), Some("<|im_end|>\n"));
}

#[test]
fn one_worker_per_spoken_turn() {
    let model = ReplayModel::new(vec![(vec!["1 One."], true), (vec!["2 Two."], true)]);
    let mut h = harness(&["first", "second", "goodbye"], model, 3_200);
    let summary = h.convo.run(&mut Presses(10)).unwrap();
    assert_eq!(summary.turns, 3);
    assert_eq!(summary.replies, 2);
    assert_eq!(h.convo.streamer().worker_spawns(), 2);
}
