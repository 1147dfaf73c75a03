use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use forge_dtype::DeviceSpec;

use crate::device::Device;
use crate::error::{InvalidDeviceSnafu, Result};

/// Extension trait for DeviceSpec to add parsing functionality.
pub trait DeviceSpecExt {
    /// Parse a device string into a DeviceSpec.
    ///
    /// Examples:
    /// - "CPU" -> DeviceSpec::Cpu
    /// - "CUDA:0" -> DeviceSpec::Cuda { device_id: 0 }
    /// - "cuda" -> DeviceSpec::Cuda { device_id: 0 } (default to device 0)
    fn parse(s: &str) -> Result<DeviceSpec>;
}

impl DeviceSpecExt for DeviceSpec {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_uppercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (s.as_str(), None),
        };

        match (kind, ordinal) {
            ("CPU", None) => Ok(DeviceSpec::Cpu),
            ("CUDA" | "GPU", None) => Ok(DeviceSpec::Cuda { device_id: 0 }),
            ("CUDA" | "GPU", Some(ordinal)) => {
                let device_id = ordinal.parse().map_err(|_| InvalidDeviceSnafu { device: s.clone() }.build())?;
                Ok(DeviceSpec::Cuda { device_id })
            }
            _ => InvalidDeviceSnafu { device: s.clone() }.fail(),
        }
    }
}

/// Process-wide table of device contexts.
///
/// # Thread Safety
///
/// Lookups take a read lock; creation double-checks under the write lock so
/// each device (and therefore each stream) is created exactly once.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceSpec, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: RwLock::new(HashMap::new()) }
    }

    /// Get or create the context of a device.
    pub fn get(&self, spec: &DeviceSpec) -> Result<Arc<Device>> {
        // Fast path: read lock
        if let Some(device) = self.devices.read().get(spec) {
            return Ok(Arc::clone(device));
        }

        let mut devices = self.devices.write();

        // Double-check after acquiring write lock
        if let Some(device) = devices.get(spec) {
            return Ok(Arc::clone(device));
        }

        let device = Arc::new(Self::create_device(spec)?);
        tracing::debug!(device = %spec, allocator = device.allocator.name(), "device context created");
        devices.insert(*spec, Arc::clone(&device));
        Ok(device)
    }

    /// Get a device by parsing a device string.
    pub fn get_device(&self, device: &str) -> Result<Arc<Device>> {
        let spec = <DeviceSpec as DeviceSpecExt>::parse(device)?;
        self.get(&spec)
    }

    /// Install an externally built context, replacing any existing one.
    pub fn register(&self, device: Arc<Device>) {
        self.devices.write().insert(device.spec, device);
    }

    fn create_device(spec: &DeviceSpec) -> Result<Device> {
        match spec {
            DeviceSpec::Cpu => Device::cpu(),
            #[cfg(feature = "cuda")]
            DeviceSpec::Cuda { device_id } => Device::cuda(*device_id),
            #[cfg(not(feature = "cuda"))]
            DeviceSpec::Cuda { .. } => crate::error::UnsupportedDeviceSnafu { device: *spec }.fail(),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global device registry instance.
static REGISTRY: Lazy<Arc<DeviceRegistry>> = Lazy::new(|| Arc::new(DeviceRegistry::new()));

/// Get the global device registry.
pub fn registry() -> &'static Arc<DeviceRegistry> {
    &REGISTRY
}

/// Convenience function to get a device by string.
pub fn get_device(device: &str) -> Result<Arc<Device>> {
    registry().get_device(device)
}

/// Convenience function to get the CPU device.
pub fn cpu() -> Result<Arc<Device>> {
    registry().get(&DeviceSpec::Cpu)
}

/// Convenience function to get a CUDA device.
#[cfg(feature = "cuda")]
pub fn cuda(device_id: usize) -> Result<Arc<Device>> {
    registry().get(&DeviceSpec::Cuda { device_id })
}
