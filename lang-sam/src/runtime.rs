//! ONNX Runtime global initialization.
//!
//! The execution provider is configured once here; sessions built afterwards
//! by the model crates inherit it. Device placement is fixed for the life of
//! the process. A requested accelerator that was not compiled in fails fast
//! with a clear message instead of silently falling back to CPU.

use anyhow::Result;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
    DirectMl,
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            "directml" => Ok(Device::DirectMl),
            _ => Err(format!("Unknown device: {s}. Use cpu, cuda or directml")),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda => write!(f, "cuda"),
            Device::DirectMl => write!(f, "directml"),
        }
    }
}

pub fn init(device: Device) -> Result<()> {
    match device {
        Device::Cuda => {
            #[cfg(feature = "cuda")]
            ort::init()
                .with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default()
                        .build()
                        .error_on_failure(),
                ])
                .commit()?;
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA requested but not compiled. Rebuild with --features cuda");
        }
        Device::DirectMl => {
            #[cfg(feature = "directml")]
            ort::init()
                .with_execution_providers([
                    ort::execution_providers::DirectMLExecutionProvider::default()
                        .build()
                        .error_on_failure(),
                ])
                .commit()?;
            #[cfg(not(feature = "directml"))]
            anyhow::bail!("DirectML requested but not compiled. Rebuild with --features directml");
        }
        Device::Cpu => {
            ort::init()
                .with_execution_providers([
                    ort::execution_providers::CPUExecutionProvider::default().build(),
                ])
                .commit()?;
        }
    }

    info!("Initialized ONNX Runtime on {device}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::from_str("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("CUDA").unwrap(), Device::Cuda);
        assert!(Device::from_str("tpu").is_err());
    }

    #[test]
    fn device_display_roundtrip() {
        for device in [Device::Cpu, Device::Cuda, Device::DirectMl] {
            assert_eq!(Device::from_str(&device.to_string()).unwrap(), device);
        }
    }
}
