//! Per-device context of the host framework.

use std::sync::Arc;

use forge_dtype::{DType, DeviceSpec};

use crate::allocator::{Allocator, BufferOptions, CpuAllocator};
use crate::buffer::Buffer;
use crate::error::Result;
use crate::stream::{CpuStream, Stream};

/// Allocator and command stream of one device.
///
/// The registry hands out a single `Device` per [`DeviceSpec`], so all work
/// for a device shares `stream` and is ordered by it.
#[derive(Debug)]
pub struct Device {
    pub spec: DeviceSpec,
    pub allocator: Arc<dyn Allocator>,
    pub stream: Arc<dyn Stream>,
}

impl Device {
    pub fn new(spec: DeviceSpec, allocator: Arc<dyn Allocator>, stream: Arc<dyn Stream>) -> Self {
        Self { spec, allocator, stream }
    }

    /// Host memory plus a fresh worker stream.
    pub fn cpu() -> Result<Self> {
        Ok(Self::new(DeviceSpec::Cpu, Arc::new(CpuAllocator), Arc::new(CpuStream::new()?)))
    }

    /// Device memory and the default stream of CUDA context `device_id`.
    #[cfg(feature = "cuda")]
    pub fn cuda(device_id: usize) -> Result<Self> {
        use snafu::ResultExt;

        use crate::allocator::CudaAllocator;
        use crate::error::CudaSnafu;
        use crate::stream::CudaStream;

        let context = cudarc::driver::CudaContext::new(device_id).context(CudaSnafu)?;
        let stream = context.default_stream();
        let allocator = CudaAllocator::with_stream(Arc::clone(&stream), device_id);
        Ok(Self::new(DeviceSpec::Cuda { device_id }, Arc::new(allocator), Arc::new(CudaStream::new(device_id, stream))))
    }

    /// Allocate an uninitialized tensor on this device.
    pub fn alloc(&self, dtype: DType, shape: Vec<usize>) -> Result<Buffer> {
        Buffer::allocate(Arc::clone(&self.allocator), dtype, shape, BufferOptions::default())
    }

    /// Allocate a tensor on this device and fill it from host data.
    pub fn upload<T: forge_dtype::ext::HasDType>(&self, data: &[T], shape: Vec<usize>) -> Result<Buffer> {
        Buffer::from_slice(Arc::clone(&self.allocator), data, shape)
    }

    /// Block until all work submitted to this device has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }
}
