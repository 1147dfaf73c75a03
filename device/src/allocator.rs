use std::ptr::NonNull;
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaSlice, CudaStream};
use forge_dtype::DeviceSpec;
#[cfg(feature = "cuda")]
use parking_lot::Mutex;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::Result;

/// Host allocation shared between the owning thread and the CPU stream worker.
///
/// The bytes are only ever reached through the raw pointer, never through a
/// reference. Callers order host reads and writes against stream work with
/// fences (see `Buffer`).
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the bytes are plain data; concurrent access is ordered by stream
// fences, never by this type.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    fn zeroed(size: usize) -> Self {
        let bytes: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(bytes)).cast::<u8>();
        Self { ptr, len: size }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` come from the boxed slice leaked in `zeroed`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)) });
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.len()).finish()
    }
}

/// Opaque handle to device memory.
#[derive(Debug)]
pub enum RawBuffer {
    Cpu { data: HostMemory },
    #[cfg(feature = "cuda")]
    Cuda { data: Mutex<CudaSlice<u8>>, stream: Arc<CudaStream> },
}

impl RawBuffer {
    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Cpu { data } => data.len(),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data.lock().len(),
        }
    }

    /// Base address of the allocation in the device's address space.
    pub fn base_address(&self) -> u64 {
        match self {
            RawBuffer::Cpu { data } => data.as_mut_ptr() as u64,
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, stream } => {
                use cudarc::driver::DevicePtr;
                let slice = data.lock();
                let (ptr, _sync) = slice.device_ptr(stream);
                ptr
            }
        }
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

/// Device-memory allocator of the host framework.
///
/// Every tensor, including the outputs of custom kernels, is allocated through
/// one of these so lifetimes stay under the framework's control.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &str;
    fn device_spec(&self) -> DeviceSpec;
}

/// CPU allocator using system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        // Host memory is always zeroed; `zero_init` costs nothing extra here.
        Ok(RawBuffer::Cpu { data: HostMemory::zeroed(size) })
    }

    fn name(&self) -> &str {
        "CPU"
    }

    fn device_spec(&self) -> DeviceSpec {
        DeviceSpec::Cpu
    }
}

/// CUDA allocator using GPU memory.
///
/// Allocations are stream-ordered on the device's default stream, the same
/// stream kernels are submitted to.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    stream: Arc<CudaStream>,
    device_id: usize,
}

#[cfg(feature = "cuda")]
impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self> {
        let context = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self::with_stream(context.default_stream(), device_id))
    }

    pub fn with_stream(stream: Arc<CudaStream>, device_id: usize) -> Self {
        Self { stream, device_id }
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

#[cfg(feature = "cuda")]
impl Allocator for CudaAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let stream = &self.stream;
        // Zero-byte device allocations are rejected by the driver.
        let size = size.max(1);
        let data = if options.zero_init { stream.alloc_zeros::<u8>(size) } else { unsafe { stream.alloc::<u8>(size) } }
            .context(CudaSnafu)?;

        Ok(RawBuffer::Cuda { data: Mutex::new(data), stream: Arc::clone(stream) })
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().context(CudaSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }

    fn device_spec(&self) -> DeviceSpec {
        DeviceSpec::Cuda { device_id: self.device_id }
    }
}
