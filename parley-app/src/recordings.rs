//! Optional WAV dump of each turn's capture.

use std::path::{Path, PathBuf};

use anyhow::Context;
use hound::{SampleFormat, WavSpec, WavWriter};
use parley_core::Recording;
use tracing::{info, warn};

/// Write `recording` as a mono 32-bit float WAV named after `turn`.
pub fn write_wav(dir: &Path, turn: u64, recording: &Recording) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating recordings dir {}", dir.display()))?;
    let path = dir.join(format!("turn-{turn:04}.wav"));

    let spec = WavSpec {
        channels: 1,
        sample_rate: recording.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(&path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for &sample in &recording.samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(path)
}

/// Observer for `ConversationLoop::set_recording_observer`.
pub fn recording_dump(dir: PathBuf) -> impl FnMut(&Recording) + 'static {
    let mut turn = 0u64;
    move |recording| {
        turn += 1;
        match write_wav(&dir, turn, recording) {
            Ok(path) => info!(path = %path.display(), "recording saved"),
            Err(e) => warn!("could not save recording: {e:#}"),
        }
    }
}
