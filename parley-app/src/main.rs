//! Parley terminal host.
//!
//! Press Enter to start recording and Enter again to stop. The reply is
//! printed as it streams and spoken through the output device. Logs go to
//! stderr (`RUST_LOG`), the conversation to stdout.

mod recordings;
mod settings;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use clap::Parser;
use parley_core::audio::device::{list_devices, DeviceDirection};
use parley_core::inference::stub::{StubModel, StubRecognizer, ToneSynthesizer};
use parley_core::{
    ConversationEvent, ConversationLoop, CpalCapture, CpalPlayback, Engines, SynthHandle,
    TurnState, TurnTrigger,
};
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Push-to-talk voice conversation")]
struct Cli {
    /// Settings file (defaults to the platform data directory).
    #[arg(long, env = "PARLEY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Print input and output devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Write the effective settings to the settings file and exit.
    #[arg(long)]
    init_settings: bool,

    /// Print conversation events as JSON lines instead of plain text.
    #[arg(long)]
    json_events: bool,

    /// Input device name (overrides the settings file).
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name (overrides the settings file).
    #[arg(long)]
    output_device: Option<String>,
}

/// Enter on stdin begins and ends a turn. EOF ends the session.
struct StdinTrigger {
    stdin: io::StdinLock<'static>,
    line: String,
}

impl StdinTrigger {
    fn new() -> Self {
        Self {
            stdin: io::stdin().lock(),
            line: String::new(),
        }
    }

    fn read_line(&mut self) -> bool {
        self.line.clear();
        matches!(self.stdin.read_line(&mut self.line), Ok(n) if n > 0)
    }
}

impl TurnTrigger for StdinTrigger {
    fn wait_for_begin(&mut self) -> bool {
        self.read_line()
    }

    fn wait_for_end(&mut self) {
        self.read_line();
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley=info,parley_core=info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        print_devices();
        return Ok(());
    }

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if cli.input_device.is_some() {
        settings.preferred_input_device = cli.input_device.clone();
    }
    if cli.output_device.is_some() {
        settings.preferred_output_device = cli.output_device.clone();
    }
    settings.normalize();

    if cli.init_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        println!("Settings written to {}", settings_path.display());
        return Ok(());
    }
    info!(path = %settings_path.display(), "settings loaded");

    let engines = Engines {
        recognizer: Box::new(StubRecognizer::new()),
        model: Box::new(StubModel::new()),
        synthesizer: SynthHandle::new(ToneSynthesizer::new(settings.synth_sample_rate)),
    };
    let mut convo = ConversationLoop::new(
        settings.conversation_config(),
        engines,
        Box::new(CpalCapture::new(settings.preferred_input_device.clone())),
        &mut CpalPlayback::new(settings.preferred_output_device.clone()),
    )
    .context("opening the output device")?;

    if let Some(dir) = settings.recordings_dir.clone() {
        info!(dir = %dir.display(), "saving recordings");
        convo.set_recording_observer(recordings::recording_dump(dir));
    }
    convo.warm_up().context("warming up the recognizer")?;

    let printer = spawn_printer(convo.subscribe(), cli.json_events)?;
    println!(
        "Parley ready. Press Enter to start/stop recording. Say {} to end.",
        settings
            .exit_phrases
            .iter()
            .map(|p| format!("'{p}'"))
            .collect::<Vec<_>>()
            .join(" or ")
    );

    let result = convo.run(&mut StdinTrigger::new());
    // Dropping the loop closes the event channel, which stops the printer.
    drop(convo);
    let _ = printer.join();

    let summary = result.context("audio device failure")?;
    info!(
        turns = summary.turns,
        replies = summary.replies,
        "session finished"
    );
    if summary.exit_transcript.is_some() {
        println!("Goodbye!");
    }
    Ok(())
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No audio devices found.");
        return;
    }
    for direction in [DeviceDirection::Input, DeviceDirection::Output] {
        println!("{direction:?} devices:");
        for device in devices.iter().filter(|d| d.direction == direction) {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("  {}{marker}", device.name);
        }
    }
}

fn spawn_printer(
    mut rx: broadcast::Receiver<ConversationEvent>,
    json: bool,
) -> anyhow::Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("parley-events".into())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(event) => {
                    if json {
                        print_json(&event);
                    } else {
                        print_plain(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        })?;
    Ok(handle)
}

fn print_json(event: &ConversationEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("could not serialise event: {e}"),
    }
}

fn print_plain(event: &ConversationEvent) {
    let mut out = io::stdout().lock();
    let _ = match event {
        ConversationEvent::State {
            state: TurnState::Recording,
        } => writeln!(out, "[Recording... press Enter to stop]"),
        ConversationEvent::Recorded {
            seconds,
            dropped_frames,
            ..
        } if *dropped_frames > 0 => writeln!(
            out,
            "Captured: {seconds:.2} seconds ({dropped_frames} frames dropped)"
        ),
        ConversationEvent::Recorded { seconds, .. } => {
            writeln!(out, "Captured: {seconds:.2} seconds")
        }
        ConversationEvent::Transcript { text } => writeln!(out, "You: {text}\n\n=== Response ==="),
        ConversationEvent::ReplyText { text } => write!(out, "{text}"),
        ConversationEvent::TurnFinished { .. } => writeln!(out, "\n"),
        ConversationEvent::Notice { message } => writeln!(out, "[{message}]"),
        ConversationEvent::State { .. } | ConversationEvent::Phrase { .. } => Ok(()),
    };
    let _ = out.flush();
}
