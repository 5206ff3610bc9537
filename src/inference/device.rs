use anyhow::{anyhow, Result};
use candle::Device;
use tracing::warn;

/// Where the embedding model should run, as parsed from `EMBED_DEVICE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Cuda(usize),
    Auto,
}

impl DevicePreference {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.is_empty() || lower == "auto" {
            Self::Auto
        } else if lower == "cpu" {
            Self::Cpu
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            let ordinal = trimmed
                .split(':')
                .nth(1)
                .and_then(|part| part.parse::<usize>().ok())
                .unwrap_or(0);
            Self::Cuda(ordinal)
        } else {
            warn!("unrecognized EMBED_DEVICE value '{trimmed}', defaulting to auto");
            Self::Auto
        }
    }

    pub fn build(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                anyhow!(
                    "requested CUDA device {ordinal} but initialization failed ({err}). \
                     Build with the `cuda` feature and ensure CUDA libraries are available."
                )
            }),
            Self::Auto => Ok(Device::cuda_if_available(0).unwrap_or(Device::Cpu)),
        }
    }
}

pub fn describe(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => format!("cuda ({device:?})"),
        Device::Metal(_) => "metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_strings() {
        assert_eq!(DevicePreference::parse("cpu"), DevicePreference::Cpu);
        assert_eq!(DevicePreference::parse(" CPU "), DevicePreference::Cpu);
        assert_eq!(DevicePreference::parse("cuda"), DevicePreference::Cuda(0));
        assert_eq!(DevicePreference::parse("cuda:1"), DevicePreference::Cuda(1));
        assert_eq!(DevicePreference::parse("gpu:2"), DevicePreference::Cuda(2));
        assert_eq!(DevicePreference::parse("auto"), DevicePreference::Auto);
        assert_eq!(DevicePreference::parse("tpu"), DevicePreference::Auto);
    }

    #[test]
    fn cpu_preference_builds_cpu_device() {
        let device = DevicePreference::Cpu.build().unwrap();
        assert!(device.is_cpu());
        assert_eq!(describe(&device), "cpu");
    }
}
