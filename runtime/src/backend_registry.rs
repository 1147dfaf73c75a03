//! Kernel backend registry.
//!
//! Maps device types to the [`Backend`] that loads kernel libraries for them.
//! Device contexts themselves (allocator and stream) come from
//! `forge_device::DeviceRegistry`; this registry only knows how to turn a
//! library artifact into pipelines for a device.

use std::collections::HashMap;
use std::sync::Arc;

use forge_dtype::DeviceSpec;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error::{Result, UnsupportedDeviceSnafu};
use crate::kernel::Backend;

/// Creates the backend for a device.
pub type BackendFactory = Arc<dyn Fn(&DeviceSpec, &RuntimeConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

fn cpu_backend(_spec: &DeviceSpec, config: &RuntimeConfig) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(crate::devices::cpu::CpuBackend::from_config(config)))
}

#[cfg(feature = "cuda")]
fn cuda_backend(_spec: &DeviceSpec, _config: &RuntimeConfig) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(crate::devices::cuda::CudaBackend))
}

/// Registry of kernel backends with per-device caching.
///
/// # Thread Safety
///
/// Lookups take a read lock; the write lock is held only while a backend is
/// created, with a double check so each device gets exactly one backend.
pub struct BackendRegistry {
    config: RuntimeConfig,
    backends: RwLock<HashMap<DeviceSpec, Arc<dyn Backend>>>,
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    /// Create a registry with the built-in backends registered.
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = Self::empty(config);

        registry.register_factory("CPU", Arc::new(cpu_backend));
        #[cfg(feature = "cuda")]
        registry.register_factory("CUDA", Arc::new(cuda_backend));

        registry
    }

    /// Create a registry without any backend.
    pub fn empty(config: RuntimeConfig) -> Self {
        Self { config, backends: RwLock::new(HashMap::new()), factories: RwLock::new(HashMap::new()) }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a backend factory for a device type ("CPU", "CUDA").
    ///
    /// The device type is case-insensitive. Backends already created for
    /// devices of that type are kept.
    pub fn register_factory(&self, device_type: &str, factory: BackendFactory) {
        self.factories.write().insert(device_type.to_uppercase(), factory);
    }

    /// Install `backend` for devices of `device_type`, replacing earlier ones.
    pub fn register(&self, device_type: &str, backend: Arc<dyn Backend>) {
        let device_type = device_type.to_uppercase();
        self.backends.write().retain(|spec, _| spec.base_type() != device_type);
        self.register_factory(
            &device_type,
            Arc::new(move |_: &DeviceSpec, _: &RuntimeConfig| Ok(Arc::clone(&backend))),
        );
    }

    /// Get or create the backend for `spec`.
    pub fn get(&self, spec: &DeviceSpec) -> Result<Arc<dyn Backend>> {
        if let Some(backend) = self.backends.read().get(spec) {
            return Ok(Arc::clone(backend));
        }

        let mut backends = self.backends.write();
        if let Some(backend) = backends.get(spec) {
            return Ok(Arc::clone(backend));
        }

        let device_type = spec.base_type();
        let factory = self
            .factories
            .read()
            .get(device_type)
            .cloned()
            .ok_or_else(|| UnsupportedDeviceSnafu { device: device_type }.build())?;

        let backend = factory(spec, &self.config)?;
        tracing::debug!(device = %spec, backend = backend.name(), "kernel backend created");
        backends.insert(*spec, Arc::clone(&backend));
        Ok(backend)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("BackendRegistry").field("config", &self.config).field("device_types", &types).finish()
    }
}
