//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Summary of an available audio device
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List input and output devices of the default host.
pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_in = host
        .default_input_device()
        .and_then(|d| d.name().ok());
    let default_out = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let mut devices = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| AudioError::CpalError(e.to_string()))?;
    for device in inputs {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                is_default: Some(&name) == default_in.as_ref(),
                name,
                is_input: true,
                is_output: false,
            });
        }
    }

    let outputs = host
        .output_devices()
        .map_err(|e| AudioError::CpalError(e.to_string()))?;
    for device in outputs {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                is_default: Some(&name) == default_out.as_ref(),
                name,
                is_input: false,
                is_output: true,
            });
        }
    }

    Ok(devices)
}

/// Resolve an input device by name, falling back to the host default.
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default input".to_string())),
    }
}

/// Resolve an output device by name, falling back to the host default.
pub fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default output".to_string())),
    }
}
