//! Host framework boundary.
//!
//! Everything a custom kernel needs from the tensor framework lives here:
//! allocators that own device memory, [`Buffer`] tensor storage with its
//! non-owning [`DeviceView`], and the single ordered [`Stream`] per device.
//! Kernel dispatch code consumes these; it never allocates through any other
//! path and never creates streams of its own.

pub mod allocator;
pub mod buffer;
pub mod device;
pub mod error;
pub mod registry;
pub mod stream;
pub mod sync;

#[cfg(test)]
pub mod test;

#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
pub use allocator::{Allocator, BufferOptions, CpuAllocator, HostMemory, RawBuffer};
pub use buffer::{Buffer, DeviceHandle, DeviceView};
pub use device::Device;
pub use error::{Error, Result};
pub use registry::{DeviceRegistry, DeviceSpec, DeviceSpecExt, cpu, get_device, registry};
#[cfg(feature = "cuda")]
pub use stream::CudaStream;
pub use stream::{CpuStream, CpuWork, Fence, Stream, SubmissionLabel, Ticket};
pub use sync::{CpuTimelineSignal, TimelineSignal};
