//! cpal device backends.
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority. They
//! **must not** block on a mutex or condvar or perform I/O:
//! - capture writes into the SPSC ring via `CaptureWriter::write`, which
//!   only moves cursors and bumps counters;
//! - playback pulls from `PlaybackCursor`, which uses `try_recv` and falls
//!   back to silence.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` and `AudioPlayback` must be created and dropped on
//! the same thread; the conversation loop does both on its control thread.

pub mod capture;
pub mod device;
pub mod output;
pub mod resample;

pub use capture::{AudioCapture, CpalCapture};
pub use output::{AudioPlayback, CpalPlayback};

#[cfg(feature = "audio-cpal")]
use cpal::traits::{DeviceTrait, HostTrait};
#[cfg(feature = "audio-cpal")]
use tracing::{info, warn};

#[cfg(feature = "audio-cpal")]
use crate::error::{ParleyError, Result};

/// Pick a device by preferred name, otherwise the host default, otherwise
/// the first one listed.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    direction: device::DeviceDirection,
    preferred: Option<&str>,
) -> Result<cpal::Device> {
    use device::DeviceDirection;

    let host = cpal::default_host();
    let list = |host: &cpal::Host| match direction {
        DeviceDirection::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceDirection::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };

    if let Some(wanted) = preferred {
        match list(&host) {
            Ok(devices) => {
                let found = devices.into_iter().find(|d| {
                    d.name()
                        .map(|name| device::name_matches(&name, wanted))
                        .unwrap_or(false)
                });
                if let Some(found) = found {
                    return Ok(found);
                }
                warn!(?direction, wanted, "preferred device not found, falling back");
            }
            Err(e) => warn!(?direction, "failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(default) = default {
        return Ok(default);
    }

    let missing = match direction {
        DeviceDirection::Input => ParleyError::NoDefaultInputDevice,
        DeviceDirection::Output => ParleyError::NoDefaultOutputDevice,
    };
    let first = list(&host)
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
        .into_iter()
        .next()
        .ok_or(missing)?;
    info!(?direction, "no default device, using first available");
    Ok(first)
}
