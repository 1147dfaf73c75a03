//! Error types for kernel dispatch.

use std::path::PathBuf;

use forge_dtype::{DType, DeviceSpec};
use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What went wrong, at the granularity callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The runtime or the device setup is unusable (unknown device type,
    /// bad configuration, stream of the wrong kind).
    Configuration,
    /// The kernel library is missing, unreadable, or lacks the entry point.
    KernelResolution,
    /// The operands cannot be combined. Nothing was allocated or submitted.
    InvalidArgument,
    /// Submitted work failed on the device.
    KernelExecution,
    /// The host framework failed to provide memory or a stream.
    Device,
}

/// Errors that can occur while dispatching a kernel.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("operands live on different devices: {lhs} and {rhs}"))]
    DeviceMismatch { lhs: DeviceSpec, rhs: DeviceSpec },

    #[snafu(display("kernel library {} cannot run on {device}: expected a .{expected} artifact", path.display()))]
    LibraryDeviceMismatch { path: PathBuf, device: DeviceSpec, expected: String },

    #[snafu(display("operands have different element counts: {lhs} and {rhs}"))]
    ShapeMismatch { lhs: usize, rhs: usize },

    #[snafu(display("operands have different element types: {lhs} and {rhs}"))]
    DTypeMismatch { lhs: DType, rhs: DType },

    #[snafu(display("operator '{operator}' takes {expected} inputs, got {actual}"))]
    InvalidArity { operator: String, expected: usize, actual: usize },

    #[snafu(display("kernel library {} not found", path.display()))]
    LibraryNotFound { path: PathBuf },

    #[snafu(display("failed to load kernel library {}: {reason}", path.display()))]
    LibraryLoad { path: PathBuf, reason: String },

    #[snafu(display("entry point '{name}' not found in {}", path.display()))]
    SymbolNotFound { name: String, path: PathBuf },

    #[snafu(display("no kernel backend for device type {device}"))]
    UnsupportedDevice { device: String },

    #[snafu(display("{backend} kernels cannot be submitted to the stream of {device}"))]
    StreamMismatch { backend: String, device: DeviceSpec },

    #[snafu(display("unknown operator '{name}'"))]
    UnknownOperator { name: String },

    #[snafu(display("invalid kernel signature for '{operator}': {reason}"))]
    InvalidSignature { operator: String, reason: String },

    #[snafu(display("invalid value {value:?} for {key}: {reason}"))]
    InvalidConfig { key: String, value: String, reason: String },

    #[snafu(display("launch of {elements} elements exceeds what {kernel} can address"))]
    LaunchTooLarge { kernel: String, elements: usize },

    #[cfg(feature = "cuda")]
    #[snafu(display("failed to launch {kernel}: {source}"))]
    Launch { kernel: String, source: cudarc::driver::DriverError },

    #[snafu(display("device error: {source}"))]
    Device { source: forge_device::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceMismatch { .. }
            | Error::LibraryDeviceMismatch { .. }
            | Error::ShapeMismatch { .. }
            | Error::DTypeMismatch { .. }
            | Error::InvalidArity { .. }
            | Error::LaunchTooLarge { .. } => ErrorKind::InvalidArgument,
            Error::LibraryNotFound { .. } | Error::LibraryLoad { .. } | Error::SymbolNotFound { .. } => {
                ErrorKind::KernelResolution
            }
            Error::UnsupportedDevice { .. }
            | Error::StreamMismatch { .. }
            | Error::UnknownOperator { .. }
            | Error::InvalidSignature { .. }
            | Error::InvalidConfig { .. } => ErrorKind::Configuration,
            #[cfg(feature = "cuda")]
            Error::Launch { .. } => ErrorKind::KernelExecution,
            Error::Device { source: forge_device::Error::KernelExecution { .. } } => ErrorKind::KernelExecution,
            Error::Device { source: forge_device::Error::UnsupportedDevice { .. } } => ErrorKind::Configuration,
            Error::Device { .. } => ErrorKind::Device,
        }
    }
}

