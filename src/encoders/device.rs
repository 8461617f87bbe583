//! Compute device selection
//!
//! The device is probed once at startup and injected into the encoder
//! factory, so indexing never queries the environment itself.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Device an encoder runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    /// NVIDIA GPU
    Cuda,
    /// Apple GPU
    Metal,
    /// General-purpose processor
    #[default]
    Cpu,
}

impl ComputeDevice {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Cpu => "cpu",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" | "cuda:0" => Some(Self::Cuda),
            "metal" | "mps" => Some(Self::Metal),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }
}

/// Snapshot of the environment facts device selection depends on
#[derive(Debug, Clone, Default)]
pub struct DeviceEnvironment {
    /// Value of `CUDA_VISIBLE_DEVICES`, if set
    pub cuda_visible_devices: Option<String>,
    /// An NVIDIA control device node exists
    pub nvidia_device_present: bool,
    /// Running on Apple Silicon (unified memory, Metal available)
    pub apple_silicon: bool,
}

impl DeviceEnvironment {
    /// Capture the current process environment
    pub fn current() -> Self {
        Self {
            cuda_visible_devices: std::env::var("CUDA_VISIBLE_DEVICES").ok(),
            nvidia_device_present: Path::new("/dev/nvidiactl").exists(),
            apple_silicon: cfg!(all(target_os = "macos", target_arch = "aarch64")),
        }
    }
}

/// Picks the accelerator when one is available, the CPU otherwise
pub struct DeviceProbe;

impl DeviceProbe {
    /// Probe the running environment
    pub fn detect() -> ComputeDevice {
        let device = Self::select(&DeviceEnvironment::current());
        tracing::info!("Selected compute device: {}", device.name());
        device
    }

    /// Pure selection over an environment snapshot
    pub fn select(env: &DeviceEnvironment) -> ComputeDevice {
        let cuda_hidden = env
            .cuda_visible_devices
            .as_deref()
            .map(|v| v.trim().is_empty() || v.trim() == "-1")
            .unwrap_or(false);

        if env.nvidia_device_present && !cuda_hidden {
            ComputeDevice::Cuda
        } else if env.apple_silicon {
            ComputeDevice::Metal
        } else {
            ComputeDevice::Cpu
        }
    }
}
