use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("device does not support {0}")]
    UnsupportedConfig(String),

    #[error("not enough audio captured: {samples} samples, need at least {required}")]
    InsufficientInput { samples: usize, required: usize },

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording in progress")]
    NotRecording,

    #[error("conversation session has ended")]
    SessionTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Device failures end the session; everything else degrades and keeps
    /// the conversation loop alive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParleyError::AudioDevice(_)
                | ParleyError::AudioStream(_)
                | ParleyError::NoDefaultInputDevice
                | ParleyError::NoDefaultOutputDevice
                | ParleyError::UnsupportedConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_errors_are_fatal() {
        assert!(ParleyError::AudioDevice("gone".into()).is_fatal());
        assert!(ParleyError::NoDefaultOutputDevice.is_fatal());
        assert!(!ParleyError::InsufficientInput {
            samples: 10,
            required: 1_600
        }
        .is_fatal());
        assert!(!ParleyError::Generation("boom".into()).is_fatal());
        assert!(!ParleyError::Recognition("boom".into()).is_fatal());
    }
}
