//! CUDA backend.
//!
//! Kernel libraries are cubins linked by `forge-build --toolchain nvcc`. Entry
//! points take the bound buffers as device pointers followed by the element
//! count:
//!
//! ```cuda
//! extern "C" __global__ void add_tensors_v1_f32(const float*, const float*, float*, unsigned int);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::sys::CUfunction_attribute;
use cudarc::driver::{CudaFunction, CudaModule, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;
use forge_device::{CudaStream, Device, Stream, Ticket};
use forge_dtype::DeviceSpec;
use smallvec::SmallVec;
use snafu::{OptionExt, ResultExt};

use crate::error::{
    LaunchSnafu, LaunchTooLargeSnafu, LibraryLoadSnafu, Result, StreamMismatchSnafu, SymbolNotFoundSnafu,
};
use crate::kernel::{Backend, KernelLibrary, Launch, Pipeline};

#[derive(Debug, Clone, Copy, Default)]
pub struct CudaBackend;

fn cuda_stream<'a>(stream: &'a dyn Stream) -> Result<&'a CudaStream> {
    stream
        .as_any()
        .downcast_ref::<CudaStream>()
        .context(StreamMismatchSnafu { backend: "CUDA", device: *stream.device() })
}

impl Backend for CudaBackend {
    fn name(&self) -> &str {
        "CUDA"
    }

    fn library_extension(&self) -> &str {
        "cubin"
    }

    fn load_library(&self, device: &Device, path: &Path) -> Result<Arc<dyn KernelLibrary>> {
        let stream = cuda_stream(device.stream.as_ref())?;
        let module = stream
            .raw()
            .context()
            .load_module(Ptx::from_file(path))
            .map_err(|e| LibraryLoadSnafu { path, reason: e.to_string() }.build())?;
        tracing::debug!(library = %path.display(), device = %device.spec, "cuda module loaded");

        Ok(Arc::new(CudaLibrary { path: path.to_path_buf(), device: device.spec, module }))
    }
}

struct CudaLibrary {
    path: PathBuf,
    device: DeviceSpec,
    module: Arc<CudaModule>,
}

impl std::fmt::Debug for CudaLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaLibrary").field("path", &self.path).field("device", &self.device).finish()
    }
}

impl KernelLibrary for CudaLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn device(&self) -> DeviceSpec {
        self.device
    }

    fn pipeline(&self, entry: &str) -> Result<Arc<dyn Pipeline>> {
        let func = self
            .module
            .load_function(entry)
            .map_err(|_| SymbolNotFoundSnafu { name: entry, path: &self.path }.build())?;
        let max_threads = func
            .get_attribute(CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .map_err(|e| LibraryLoadSnafu { path: &self.path, reason: e.to_string() }.build())?;
        let max_group_size = usize::try_from(max_threads).unwrap_or(1).max(1);
        tracing::debug!(kernel.name = %entry, max_group_size, "cuda pipeline created");

        Ok(Arc::new(CudaPipeline { name: entry.to_string(), func, max_group_size }))
    }
}

struct CudaPipeline {
    name: String,
    func: CudaFunction,
    max_group_size: usize,
}

impl std::fmt::Debug for CudaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaPipeline").field("name", &self.name).field("max_group_size", &self.max_group_size).finish()
    }
}

impl Pipeline for CudaPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_group_size(&self) -> usize {
        self.max_group_size
    }

    fn encode(&self, stream: &dyn Stream, launch: Launch<'_>) -> Result<Ticket> {
        let stream = cuda_stream(stream)?;
        let geometry = launch.geometry;
        let (count, groups, group_size) = geometry
            .dims_u32()
            .ok_or_else(|| LaunchTooLargeSnafu { kernel: &self.name, elements: geometry.elements }.build())?;

        let pointers: SmallVec<[u64; 4]> = launch.args.iter().map(|view| view.address()).collect();
        let config = LaunchConfig { grid_dim: (groups, 1, 1), block_dim: (group_size, 1, 1), shared_mem_bytes: 0 };
        tracing::trace!(kernel.name = %self.name, elements = count, groups, group_size, "encoding cuda kernel");

        let mut builder = stream.raw().launch_builder(&self.func);
        for pointer in &pointers {
            builder.arg(pointer);
        }
        builder.arg(&count);
        // SAFETY: the arguments match the entry-point signature and every
        // pointer addresses at least `count` elements.
        unsafe { builder.launch(config) }.context(LaunchSnafu { kernel: &self.name })?;

        // Frees of the pinned buffers are ordered on this same stream, after
        // the launch, so the pins can be released now.
        drop(launch.pins);
        Ok(stream.record_submission())
    }
}
