//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::ConversationConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Rate the built-in tone synthesizer renders at; the output device is
    /// opened at this rate.
    pub synth_sample_rate: u32,
    pub speech_speed: f32,
    pub exit_phrases: Vec<String>,
    pub system_preamble: String,
    pub max_fragments: usize,
    /// Recordings shorter than this are ignored.
    pub min_recording_secs: f32,
    /// When set, each turn's capture is saved here as a WAV file.
    pub recordings_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let core = ConversationConfig::default();
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            synth_sample_rate: 22_050,
            speech_speed: core.synthesis.speed,
            exit_phrases: core.exit_phrases,
            system_preamble: core.system_preamble,
            max_fragments: core.max_fragments,
            min_recording_secs: 0.1,
            recordings_dir: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_device(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device(self.preferred_output_device.take());
        self.synth_sample_rate = self.synth_sample_rate.clamp(8_000, 96_000);
        self.speech_speed = if self.speech_speed.is_finite() {
            self.speech_speed.clamp(0.5, 2.5)
        } else {
            1.2
        };
        self.exit_phrases = normalize_phrases(&self.exit_phrases);
        if self.exit_phrases.is_empty() {
            self.exit_phrases = ConversationConfig::default().exit_phrases;
        }
        self.system_preamble = self.system_preamble.trim().to_string();
        self.max_fragments = self.max_fragments.clamp(16, 32_768);
        self.min_recording_secs = if self.min_recording_secs.is_finite() {
            self.min_recording_secs.clamp(0.05, 5.0)
        } else {
            0.1
        };
        self.recordings_dir = self
            .recordings_dir
            .take()
            .filter(|dir| !dir.as_os_str().is_empty());
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        let mut config = ConversationConfig::default();
        config.synthesis.speed = self.speech_speed;
        config.synthesis.drain_grace = Duration::from_secs(2);
        config.exit_phrases = self.exit_phrases.clone();
        config.system_preamble = self.system_preamble.clone();
        config.max_fragments = self.max_fragments;
        config.recorder.min_recording_samples =
            (self.min_recording_secs * config.recorder.target_sample_rate as f32).round() as usize;
        config
    }
}

fn normalize_device(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

fn normalize_phrases(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for phrase in raw {
        let phrase = phrase.trim().to_lowercase();
        if !phrase.is_empty() && !out.contains(&phrase) {
            out.push(phrase);
        }
    }
    out
}

/// Directory under the per-user data directory that holds Parley's files.
const APP_DIR: &str = "parley";
const SETTINGS_FILE: &str = "settings.json";

/// `%APPDATA%` on Windows, `$XDG_DATA_HOME` (or `~/.local/share`) elsewhere.
fn user_data_dir() -> PathBuf {
    let var = |name: &str| std::env::var_os(name).map(PathBuf::from);
    if cfg!(target_os = "windows") {
        return var("APPDATA").unwrap_or_else(|| PathBuf::from("."));
    }
    var("XDG_DATA_HOME").unwrap_or_else(|| {
        var("HOME")
            .unwrap_or_else(std::env::temp_dir)
            .join(".local/share")
    })
}

pub fn default_settings_path() -> PathBuf {
    user_data_dir().join(APP_DIR).join(SETTINGS_FILE)
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<AppSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed settings: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

/// Written to a sibling `.json.tmp` file, then renamed into place.
pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        fs::create_dir_all(dir)?;
    }
    let mut json = serde_json::to_vec_pretty(settings).map_err(std::io::Error::other)?;
    json.push(b'\n');
    let staged = path.with_extension("json.tmp");
    fs::write(&staged, json)?;
    fs::rename(&staged, path)
}
