// Common model utilities and types
// Device selection for Candle

use anyhow::{bail, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Device configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use best available device (CUDA, then Metal, then CPU)
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// First CUDA device
    Cuda,
    /// Force Metal (Apple Silicon GPU)
    Metal,
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => bail!("Unknown device '{}' (expected auto, cpu, cuda or metal)", other),
        }
    }
}

/// Resolve a device preference to a Candle device
pub fn get_device_with_preference(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)?,
        DevicePreference::Metal => Device::new_metal(0)?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    tracing::debug!(device = %device_info(&device), "Selected device");
    Ok(device)
}

/// Human readable device name
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_preference() {
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_device() {
        let device = get_device_with_preference(DevicePreference::Cpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(device_info(&device), "CPU");
    }
}
