//! Explicit compute device selection.

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Metal, then CUDA, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Resolves `preference` to a device. `Auto` falls back to the CPU when no
/// accelerator initialises; an explicit accelerator request that fails is an
/// error.
pub fn select_device(preference: DevicePreference) -> Result<Device, TrainingError> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0)
            .map_err(|err| TrainingError::initialization(format!("failed to open CUDA device: {err}"))),
        DevicePreference::Metal => Device::new_metal(0)
            .map_err(|err| TrainingError::initialization(format!("failed to open Metal device: {err}"))),
        DevicePreference::Auto => {
            log::debug!(
                "device detection: cuda_available={} metal_available={}",
                cuda_is_available(),
                metal_is_available()
            );
            if metal_is_available() {
                match Device::new_metal(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => log::warn!("failed to initialize metal device, falling back: {err}"),
                }
            }
            if cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
                }
            }
            Ok(Device::Cpu)
        }
    }
}
