//! Sample-rate conversion for captured audio using a rubato `FastFixedIn`
//! resampler.
//!
//! `cpal` captures at the device's native rate (commonly 44.1 or 48 kHz).
//! Recognition wants 16 kHz mono f32. `RateConverter` bridges that gap on the
//! recorder's drain thread, where allocation is allowed. When the rates match
//! it is a passthrough and no rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// Input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `ParleyError::AudioStream` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate.max(1) as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParleyError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(source_rate, target_rate, chunk_size, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Convert `samples`, appending whatever output is ready to `out`.
    ///
    /// Input is held internally until a full `chunk_size` block is available.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            out.extend_from_slice(samples);
            return;
        };

        self.input_buf.extend_from_slice(samples);

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
    }

    /// Convert whatever partial block is still held, zero-padding the input
    /// and trimming the padded part off the output.
    pub fn flush_into(&mut self, out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            return;
        };
        if self.input_buf.is_empty() {
            return;
        }

        let expected = (self.input_buf.len() as f64 * self.ratio).round() as usize;
        let wave_in = [&self.input_buf[..]];
        match resampler.process_partial_into_buffer(
            Some(&wave_in[..]),
            &mut self.output_buf,
            None,
        ) {
            Ok((_consumed, produced)) => {
                out.extend_from_slice(&self.output_buf[0][..produced.min(expected)]);
            }
            Err(e) => error!("resampler flush error: {e}"),
        }
        self.input_buf.clear();
    }

    /// Returns `true` when source rate == target rate.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 1_600).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let mut out = Vec::new();
        rc.process_into(&samples, &mut out);
        rc.flush_into(&mut out);
        assert_eq!(out, samples);
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        let mut out = Vec::new();
        rc.process_into(&vec![0.0f32; 960], &mut out);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn partial_input_is_held_until_flush() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let mut out = Vec::new();
        rc.process_into(&vec![0.0f32; 500], &mut out);
        assert!(out.is_empty(), "expected nothing before a full block");

        rc.flush_into(&mut out);
        assert!(!out.is_empty(), "flush should release the held tail");
        assert!(out.len() <= 167, "padding leaked into output: {}", out.len());
    }

    #[test]
    fn silence_stays_silent() {
        let mut rc = RateConverter::new(44_100, 16_000, 1_024).unwrap();
        let mut out = Vec::new();
        rc.process_into(&vec![0.0f32; 4_096], &mut out);
        rc.flush_into(&mut out);
        for s in out {
            assert_abs_diff_eq!(s, 0.0, epsilon = 1e-6);
        }
    }
}
