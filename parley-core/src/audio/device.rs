//! Audio device enumeration and lookup.

use serde::{Deserialize, Serialize};

/// Whether a device records or plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
}

/// Order devices for display: defaults first, then by name.
pub fn sort_devices(devices: &mut [DeviceInfo]) {
    devices.sort_by_key(|d| {
        (
            d.direction == DeviceDirection::Output,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
}

/// Case-insensitive exact match on a trimmed device name.
pub fn name_matches(candidate: &str, wanted: &str) -> bool {
    candidate.trim().eq_ignore_ascii_case(wanted.trim())
}

/// List input and output devices on the default host.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut list = Vec::new();
    match host.input_devices() {
        Ok(devices) => list.extend(devices.enumerate().map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            DeviceInfo {
                is_default: default_in.as_deref() == Some(name.as_str()),
                name,
                direction: DeviceDirection::Input,
            }
        })),
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }
    match host.output_devices() {
        Ok(devices) => list.extend(devices.enumerate().map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
            DeviceInfo {
                is_default: default_out.as_deref() == Some(name.as_str()),
                name,
                direction: DeviceDirection::Output,
            }
        })),
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    sort_devices(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(name: &str, direction: DeviceDirection, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction,
            is_default,
        }
    }

    #[test]
    fn inputs_then_outputs_with_defaults_first() {
        let mut list = vec![
            dev("Speakers", DeviceDirection::Output, false),
            dev("zoom mic", DeviceDirection::Input, false),
            dev("HDMI", DeviceDirection::Output, true),
            dev("Array Mic", DeviceDirection::Input, true),
            dev("Bluetooth", DeviceDirection::Input, false),
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Array Mic", "Bluetooth", "zoom mic", "HDMI", "Speakers"]
        );
    }

    #[test]
    fn name_match_ignores_case_and_padding() {
        assert!(name_matches("USB Microphone ", "usb microphone"));
        assert!(!name_matches("USB Microphone", "usb"));
    }
}
