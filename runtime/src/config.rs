//! Runtime configuration.

use std::path::PathBuf;

use crate::Result;
use crate::error::InvalidConfigSnafu;

/// Where packaged kernel libraries live unless `FORGE_KERNEL_DIR` says otherwise.
pub const DEFAULT_KERNEL_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../target/kernels");

/// Default (and maximum) worker-group size of the host reference device.
pub const DEFAULT_CPU_GROUP_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directory holding the packaged kernel libraries.
    pub kernel_dir: PathBuf,
    /// File stem of the packaged libraries.
    pub library_name: String,
    /// Group size reported by host reference pipelines.
    pub cpu_max_group_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernel_dir: PathBuf::from(DEFAULT_KERNEL_DIR),
            library_name: "default".to_string(),
            cpu_max_group_size: DEFAULT_CPU_GROUP_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from the process environment.
    ///
    /// - `FORGE_KERNEL_DIR`: directory of the packaged kernel libraries
    /// - `FORGE_KERNEL_LIBRARY`: library file stem (default `default`)
    /// - `FORGE_CPU_GROUP_SIZE`: positive group size for the host device
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("FORGE_KERNEL_DIR").filter(|dir| !dir.is_empty()) {
            config.kernel_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("FORGE_KERNEL_LIBRARY").filter(|name| !name.is_empty()) {
            config.library_name = name;
        }
        if let Some(value) = lookup("FORGE_CPU_GROUP_SIZE") {
            config.cpu_max_group_size = match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => size,
                Ok(_) => {
                    return InvalidConfigSnafu { key: "FORGE_CPU_GROUP_SIZE", value, reason: "must be positive" }.fail();
                }
                Err(e) => {
                    return InvalidConfigSnafu { key: "FORGE_CPU_GROUP_SIZE", reason: e.to_string(), value }.fail();
                }
            };
        }

        tracing::debug!(
            kernel_dir = %config.kernel_dir.display(),
            cpu_group = config.cpu_max_group_size,
            "runtime config"
        );
        Ok(config)
    }

    pub fn with_kernel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_dir = dir.into();
        self
    }

    pub fn with_cpu_max_group_size(mut self, size: usize) -> Self {
        self.cpu_max_group_size = size;
        self
    }

    /// Path of the packaged library with the given artifact extension.
    pub fn library_path(&self, extension: &str) -> PathBuf {
        self.kernel_dir.join(format!("{}.{extension}", self.library_name))
    }
}
