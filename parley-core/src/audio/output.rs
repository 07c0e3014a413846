//! Persistent speaker output fed from a `PlaybackCursor`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

use crate::{
    error::{ParleyError, Result},
    synthesis::{PlaybackBackend, PlaybackCursor, PlaybackHandle},
};

/// Opens the preferred (or default) output device once per streamer.
#[derive(Debug, Clone, Default)]
pub struct CpalPlayback {
    pub preferred_device: Option<String>,
}

impl CpalPlayback {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

impl PlaybackBackend for CpalPlayback {
    fn open(&mut self, sample_rate: u32, cursor: PlaybackCursor) -> Result<Box<dyn PlaybackHandle>> {
        let playback = AudioPlayback::open(cursor, sample_rate, self.preferred_device.as_deref())?;
        Ok(Box::new(playback))
    }
}

/// Handle to the running output stream.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct AudioPlayback {
    #[cfg(feature = "audio-cpal")]
    stream: Stream,
    running: Arc<AtomicBool>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[cfg(feature = "audio-cpal")]
impl AudioPlayback {
    /// Open an output device at exactly `sample_rate`. Mono is preferred,
    /// then stereo, then whatever else the device offers; the mono signal is
    /// copied to every channel.
    ///
    /// # Errors
    /// `UnsupportedConfig` if no output config covers `sample_rate`; other
    /// device errors as `AudioDevice`/`AudioStream`.
    pub fn open(
        cursor: PlaybackCursor,
        sample_rate: u32,
        preferred_device: Option<&str>,
    ) -> Result<Self> {
        let device =
            super::select_device(super::device::DeviceDirection::Output, preferred_device)?;
        let device_name = device.name().unwrap_or_default();

        let mut candidates: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
            .filter(|range| {
                range.min_sample_rate().0 <= sample_rate && sample_rate <= range.max_sample_rate().0
            })
            .collect();
        candidates.sort_by_key(|range| {
            (
                match range.channels() {
                    1 => 0,
                    2 => 1,
                    _ => 2,
                },
                range.sample_format() != SampleFormat::F32,
            )
        });
        let Some(range) = candidates.into_iter().next() else {
            return Err(ParleyError::UnsupportedConfig(format!(
                "output device '{device_name}' cannot play at {sample_rate} Hz"
            )));
        };

        let supported = range.with_sample_rate(SampleRate(sample_rate));
        let channels = supported.channels();
        info!(
            device = device_name.as_str(),
            sample_rate,
            channels,
            format = ?supported.sample_format(),
            "opening output device"
        );

        let config: StreamConfig = supported.config();
        let running = Arc::new(AtomicBool::new(true));
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, cursor, &running),
            SampleFormat::I16 => build_output::<i16>(&device, &config, cursor, &running),
            SampleFormat::I32 => build_output::<i32>(&device, &config, cursor, &running),
            SampleFormat::U16 => build_output::<u16>(&device, &config, cursor, &running),
            SampleFormat::U8 => build_output::<u8>(&device, &config, cursor, &running),
            fmt => {
                return Err(ParleyError::UnsupportedConfig(format!(
                    "unsupported output sample format: {fmt:?}"
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
            channels,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut cursor: PlaybackCursor,
    running: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let running = Arc::clone(running);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }
                for frame in data.chunks_mut(channels) {
                    let sample = T::from_sample(cursor.next_sample());
                    frame.fill(sample);
                }
                cursor.publish();
            },
            |err| error!("audio output stream error: {err}"),
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioPlayback {
    pub fn open(
        _cursor: PlaybackCursor,
        _sample_rate: u32,
        _preferred_device: Option<&str>,
    ) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl PlaybackHandle for AudioPlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.pause_stream();
    }
}

impl AudioPlayback {
    #[cfg(feature = "audio-cpal")]
    fn pause_stream(&self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("output stream pause failed: {e}");
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn pause_stream(&self) {}
}
