use std::sync::Arc;

use forge_dtype::ext::HasDType;
use forge_dtype::{DType, DeviceSpec};
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{DTypeMismatchSnafu, InvalidViewSnafu, Result, SizeMismatchSnafu};
use crate::stream::Fence;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

/// Shared allocation referenced by every view of a tensor.
#[derive(Debug)]
struct Storage {
    /// Always `Some` until drop hands it back to the allocator.
    raw: Option<RawBuffer>,
    allocator: Arc<dyn Allocator>,
    /// Last submitted work that writes this storage.
    writer: Mutex<Option<Fence>>,
    /// Last submitted work that reads this storage.
    reader: Mutex<Option<Fence>>,
}

impl Storage {
    fn raw(&self) -> &RawBuffer {
        self.raw.as_ref().expect("storage used after release")
    }

    /// Wait until the current contents are final and report how they were produced.
    fn wait_writer(&self) -> Result<()> {
        let fence = self.writer.lock().clone();
        match fence {
            Some(fence) => fence.wait(),
            None => Ok(()),
        }
    }

    /// Wait until no submitted work still reads or writes the storage.
    fn wait_idle(&self) -> Result<()> {
        let fences = [self.reader.lock().clone(), self.writer.lock().clone()];
        for fence in fences.iter().flatten() {
            fence.wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.allocator.free(raw);
        }
    }
}

/// Raw address of device memory; meaningful only on the owning device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Non-owning description of device memory backing a tensor.
///
/// This is what kernel arguments are bound from. Holding a view keeps nothing
/// alive; whoever encodes work with it must also pin the owning [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceView {
    pub device: DeviceSpec,
    /// Base address of the whole allocation.
    pub handle: DeviceHandle,
    /// Byte offset of the first element from `handle`.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
    pub dtype: DType,
}

impl DeviceView {
    /// Address of the first element.
    pub fn address(&self) -> u64 {
        self.handle.0 + self.offset as u64
    }

    pub fn byte_len(&self) -> usize {
        self.len * self.dtype.bytes()
    }
}

/// Tensor storage of the host framework: a typed, shaped view into a shared
/// device allocation.
///
/// Contents follow stream semantics. After work that writes the buffer has
/// been submitted, the contents are defined only once that work completes;
/// host reads ([`copyout`](Buffer::copyout), [`to_vec`](Buffer::to_vec)) wait
/// for it and surface its failure, if any.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    /// Offset into the base buffer (in bytes).
    offset: usize,
    /// Size of this view (in bytes).
    size: usize,
    dtype: DType,
    shape: SmallVec<[usize; 4]>,
}

impl Buffer {
    /// Allocate a new buffer through `allocator`.
    pub fn allocate(
        allocator: Arc<dyn Allocator>,
        dtype: DType,
        shape: Vec<usize>,
        options: BufferOptions,
    ) -> Result<Self> {
        let size = dtype.bytes() * shape.iter().product::<usize>();
        let raw = allocator.alloc(size, &options)?;
        let storage = Storage {
            raw: Some(raw),
            allocator,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        };
        Ok(Self { storage: Arc::new(storage), offset: 0, size, dtype, shape: SmallVec::from_vec(shape) })
    }

    /// Allocate a buffer and fill it from host data.
    pub fn from_slice<T: HasDType>(allocator: Arc<dyn Allocator>, data: &[T], shape: Vec<usize>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        snafu::ensure!(expected == data.len(), SizeMismatchSnafu { expected, actual: data.len() });

        let mut buffer = Self::allocate(allocator, T::DTYPE, shape, BufferOptions::default())?;
        buffer.copyin(bytemuck::cast_slice(data))?;
        Ok(buffer)
    }

    /// Create a flat view of `size` bytes starting `offset` bytes into this buffer.
    pub fn view(&self, offset: usize, size: usize) -> Result<Self> {
        if offset + size > self.size {
            return InvalidViewSnafu { offset, size, buffer_size: self.size }.fail();
        }

        Ok(Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            size,
            dtype: self.dtype,
            shape: smallvec![size / self.dtype.bytes()],
        })
    }

    /// Get the size of this buffer view in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the offset of this view in bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn device(&self) -> DeviceSpec {
        self.storage.allocator.device_spec()
    }

    /// Get the allocator used by this buffer.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.storage.allocator
    }

    /// Whether two buffers share one allocation.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Describe the memory behind this buffer for kernel argument binding.
    pub fn device_view(&self) -> DeviceView {
        DeviceView {
            device: self.device(),
            handle: DeviceHandle(self.storage.raw().base_address()),
            offset: self.offset,
            len: self.size / self.dtype.bytes(),
            dtype: self.dtype,
        }
    }

    /// Mark the buffer as written by submitted work.
    pub fn record_write(&self, fence: Fence) {
        *self.storage.writer.lock() = Some(fence);
    }

    /// Mark the buffer as read by submitted work.
    pub fn record_read(&self, fence: Fence) {
        *self.storage.reader.lock() = Some(fence);
    }

    /// The submission whose completion defines the current contents, if any.
    pub fn pending_write(&self) -> Option<Fence> {
        self.storage.writer.lock().clone()
    }

    /// Block until the contents are defined.
    ///
    /// Fails with `KernelExecution` if the work that produced them faulted.
    pub fn materialize(&self) -> Result<()> {
        self.storage.wait_writer()
    }

    /// Copy data from host memory into this buffer.
    ///
    /// Waits for in-flight work on the storage first, then replaces the
    /// contents; the previous producer's outcome no longer matters.
    pub fn copyin(&mut self, src: &[u8]) -> Result<()> {
        let expected = self.size;
        let actual = src.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        self.storage.wait_idle()?;
        match self.storage.raw() {
            RawBuffer::Cpu { data } => {
                // SAFETY: bounds checked above; no stream work touches the storage.
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), data.as_mut_ptr().add(self.offset), src.len()) };
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, stream } => {
                let mut slice = data.lock();
                let mut view = slice.slice_mut(self.offset..self.offset + self.size);
                stream.memcpy_htod(src, &mut view).context(CudaSnafu)?;
            }
        }
        *self.storage.writer.lock() = None;
        Ok(())
    }

    /// Copy data from this buffer to host memory.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let expected = self.size;
        let actual = dst.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        self.materialize()?;
        match self.storage.raw() {
            RawBuffer::Cpu { data } => {
                // SAFETY: bounds checked above; the producing work has completed.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_mut_ptr().add(self.offset), dst.as_mut_ptr(), dst.len());
                }
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, stream } => {
                let slice = data.lock();
                let view = slice.slice(self.offset..self.offset + self.size);
                stream.memcpy_dtoh(&view, dst).context(CudaSnafu)
            }
        }
    }

    /// Read the contents as host values of type `T`.
    pub fn to_vec<T: HasDType>(&self) -> Result<Vec<T>> {
        snafu::ensure!(T::DTYPE == self.dtype, DTypeMismatchSnafu { expected: T::DTYPE, actual: self.dtype });

        let mut out = vec![T::zeroed(); self.size / self.dtype.bytes()];
        self.copyout(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }
}
