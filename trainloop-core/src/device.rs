//! Compute devices and the capability object describing what this host offers.

use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable consulted by [`DeviceCapabilities::from_env`].
pub const ACCELERATORS_ENV: &str = "TRAINLOOP_NUM_ACCELERATORS";

/// A compute device a tensor can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => {
                let index = s
                    .strip_prefix("cuda:")
                    .and_then(|i| i.parse::<usize>().ok())
                    .ok_or_else(|| RunnerError::configuration(format!("unknown device '{s}'")))?;
                Ok(Device::Cuda(index))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = RunnerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// What the host can run on. Passed explicitly into engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub accelerator_count: usize,
}

impl DeviceCapabilities {
    pub fn cpu_only() -> Self {
        Self::default()
    }

    pub fn with_accelerators(count: usize) -> Self {
        Self {
            accelerator_count: count,
        }
    }

    /// Read the accelerator count from `TRAINLOOP_NUM_ACCELERATORS`, defaulting to none.
    pub fn from_env() -> Self {
        let count = std::env::var(ACCELERATORS_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        Self::with_accelerators(count)
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator_count > 0
    }

    /// Fail if `device` does not exist on this host.
    pub fn check(&self, device: &Device) -> Result<()> {
        match device {
            Device::Cpu => Ok(()),
            Device::Cuda(index) if *index < self.accelerator_count => Ok(()),
            Device::Cuda(index) => Err(RunnerError::configuration(format!(
                "device cuda:{index} requested but {} accelerator(s) available",
                self.accelerator_count
            ))),
        }
    }

    /// Every device on this host, CPU first.
    pub fn devices(&self) -> Vec<Device> {
        std::iter::once(Device::Cpu)
            .chain((0..self.accelerator_count).map(Device::Cuda))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for device in [Device::Cpu, Device::Cuda(3)] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn test_capability_check() {
        let caps = DeviceCapabilities::with_accelerators(1);
        assert!(caps.check(&Device::Cpu).is_ok());
        assert!(caps.check(&Device::Cuda(0)).is_ok());
        assert!(caps.check(&Device::Cuda(1)).is_err());
        assert!(DeviceCapabilities::cpu_only().check(&Device::Cuda(0)).is_err());
        assert_eq!(caps.devices(), vec![Device::Cpu, Device::Cuda(0)]);
    }

    #[test]
    fn test_device_serde_as_string() {
        let json = serde_json::to_string(&Device::Cuda(2)).unwrap();
        assert_eq!(json, "\"cuda:2\"");
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Device::Cuda(2));
    }
}
