//! Sample buffer handed from the turn recorder to recognition.

/// Mono PCM captured during one turn.
///
/// Owned by whoever holds it; moved from the recorder into recognition.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 for recognition input).
    pub sample_rate: u32,
    /// Frames lost to ring overflow during this recording (device rate).
    pub dropped_frames: u64,
}

impl Recording {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            dropped_frames: 0,
        }
    }

    /// Returns the duration of this recording in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the recording contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_sample_rate() {
        let rec = Recording::new(vec![0.0; 8_000], 16_000);
        assert!((rec.duration_secs() - 0.5).abs() < 1e-9);
        assert!(Recording::default().duration_secs() == 0.0);
    }
}
