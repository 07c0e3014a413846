//! Microphone capture into the SPSC ring.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

use crate::{
    buffering::CaptureWriter,
    error::{ParleyError, Result},
    recorder::{CaptureBackend, CaptureHandle},
};

/// Opens the preferred (or default) microphone for each recording.
#[derive(Debug, Clone, Default)]
pub struct CpalCapture {
    pub preferred_device: Option<String>,
}

impl CpalCapture {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

impl CaptureBackend for CpalCapture {
    fn open(&mut self, writer: CaptureWriter) -> Result<Box<dyn CaptureHandle>> {
        let capture = AudioCapture::open(writer, self.preferred_device.as_deref())?;
        Ok(Box::new(capture))
    }
}

/// Handle to an active capture stream.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    stream: Stream,
    /// Cleared to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Device rate the ring is filled at (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open an input device at its default config. Multi-channel input is
    /// averaged down to mono in the callback.
    ///
    /// # Errors
    /// `NoDefaultInputDevice`, `AudioDevice` or `AudioStream` when the
    /// device cannot be opened or started.
    pub fn open(writer: CaptureWriter, preferred_device: Option<&str>) -> Result<Self> {
        let device = super::select_device(super::device::DeviceDirection::Input, preferred_device)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "audio config selected");

        let config: StreamConfig = supported.config();
        let running = Arc::new(AtomicBool::new(true));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, writer, &running),
            SampleFormat::I16 => build_input::<i16>(&device, &config, writer, &running),
            SampleFormat::I32 => build_input::<i32>(&device, &config, writer, &running),
            SampleFormat::U16 => build_input::<u16>(&device, &config, writer, &running),
            SampleFormat::U8 => build_input::<u8>(&device, &config, writer, &running),
            fmt => {
                return Err(ParleyError::UnsupportedConfig(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(Self {
            stream,
            running,
            sample_rate,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut writer: CaptureWriter,
    running: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let running = Arc::clone(running);
    // Sized once for a generous callback; `resize` below only grows it if a
    // driver hands over an unusually large block.
    let mut mono: Vec<f32> = Vec::with_capacity(8_192);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (out, frame) in mono.iter_mut().zip(data.chunks_exact(channels)) {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    *out = sum / channels as f32;
                }
                writer.write(&mono);
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(_writer: CaptureWriter, _preferred_device: Option<&str>) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl CaptureHandle for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.pause_stream();
    }
}

impl AudioCapture {
    #[cfg(feature = "audio-cpal")]
    fn pause_stream(&self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("input stream pause failed: {e}");
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn pause_stream(&self) {}
}
