use forge_dtype::{DType, DeviceSpec};
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Shape of target tensor does not match expected shape.
    #[snafu(display("shape mismatch: expected {expected:?}, got {actual:?}"))]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("dtype mismatch: buffer holds {actual}, requested {expected}"))]
    DTypeMismatch { expected: DType, actual: DType },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// The device type is known but not compiled into this build.
    #[snafu(display("device {device} is not supported by this build"))]
    UnsupportedDevice { device: DeviceSpec },

    /// Invalid buffer view parameters.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    #[snafu(display("allocation of {size} bytes on {device} failed: {reason}"))]
    Allocation { device: DeviceSpec, size: usize, reason: String },

    /// The stream no longer accepts work (its worker has shut down).
    #[snafu(display("command stream for {device} is closed"))]
    StreamClosed { device: DeviceSpec },

    #[snafu(display("failed to start stream worker: {source}"))]
    WorkerSpawn { source: std::io::Error },

    #[snafu(display("timed out after {waited_ms}ms waiting for ticket {ticket} (completed {completed})"))]
    Timeout { ticket: u64, completed: u64, waited_ms: u64 },

    /// Submitted work failed on the device.
    ///
    /// Reported when the result of that work is first observed.
    #[snafu(display("kernel '{kernel}' of operator '{operator}' failed on device: {reason}"))]
    KernelExecution { operator: String, kernel: String, reason: String },

    #[cfg(feature = "cuda")]
    /// CUDA-specific errors.
    #[snafu(display("CUDA error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },
}
