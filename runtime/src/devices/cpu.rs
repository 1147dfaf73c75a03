//! Host reference backend.
//!
//! Kernel libraries are shared objects built by `forge-build` with clang and
//! loaded with `dlopen`. Every entry point follows one C ABI:
//!
//! ```c
//! int add_tensors_v1_f32(void **args, const long long *vars);
//! ```
//!
//! `args` holds the bound buffer addresses in entry-point order and `vars` is
//! `[element_count, group_id, group_size]`. A launch calls the entry once per
//! group on the device's stream worker; a nonzero return faults the
//! submission.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_device::{CpuStream, CpuWork, Device, Stream, Ticket};
use forge_dtype::DeviceSpec;
use smallvec::SmallVec;
use snafu::ResultExt;

use crate::config::RuntimeConfig;
use crate::error::{DeviceSnafu, LibraryLoadSnafu, Result, StreamMismatchSnafu, SymbolNotFoundSnafu};
use crate::kernel::{Backend, KernelLibrary, Launch, Pipeline};

type KernelFn = unsafe extern "C" fn(*const *mut u8, *const i64) -> i32;

/// Loads shared-object kernel libraries for host memory.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    max_group_size: usize,
}

impl CpuBackend {
    pub fn new(max_group_size: usize) -> Self {
        Self { max_group_size: max_group_size.max(1) }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.cpu_max_group_size)
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "CPU"
    }

    fn library_extension(&self) -> &str {
        "so"
    }

    fn load_library(&self, _device: &Device, path: &Path) -> Result<Arc<dyn KernelLibrary>> {
        // SAFETY: loading runs the library's initializers. Kernel libraries are
        // plain C object code without constructors.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| LibraryLoadSnafu { path, reason: e.to_string() }.build())?;
        tracing::debug!(library = %path.display(), "cpu kernel library loaded");

        Ok(Arc::new(CpuLibrary {
            path: path.to_path_buf(),
            library: Arc::new(library),
            max_group_size: self.max_group_size,
        }))
    }
}

#[derive(Debug)]
struct CpuLibrary {
    path: PathBuf,
    library: Arc<libloading::Library>,
    max_group_size: usize,
}

impl KernelLibrary for CpuLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cpu
    }

    fn pipeline(&self, entry: &str) -> Result<Arc<dyn Pipeline>> {
        // SAFETY: entry points of CPU kernel libraries all have the `KernelFn` ABI.
        let func: KernelFn = unsafe {
            *self
                .library
                .get::<KernelFn>(entry.as_bytes())
                .map_err(|_| SymbolNotFoundSnafu { name: entry, path: &self.path }.build())?
        };
        tracing::debug!(kernel.name = %entry, max_group_size = self.max_group_size, "cpu pipeline created");

        Ok(Arc::new(CpuPipeline {
            name: entry.to_string(),
            func,
            library: Arc::clone(&self.library),
            max_group_size: self.max_group_size,
        }))
    }
}

#[derive(Debug)]
struct CpuPipeline {
    name: String,
    func: KernelFn,
    /// Keeps `func` mapped.
    library: Arc<libloading::Library>,
    max_group_size: usize,
}

impl Pipeline for CpuPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_group_size(&self) -> usize {
        self.max_group_size
    }

    fn encode(&self, stream: &dyn Stream, launch: Launch<'_>) -> Result<Ticket> {
        let stream = stream
            .as_any()
            .downcast_ref::<CpuStream>()
            .ok_or_else(|| StreamMismatchSnafu { backend: "CPU", device: *stream.device() }.build())?;

        let addresses: SmallVec<[usize; 4]> = launch.args.iter().map(|view| view.address() as usize).collect();
        let Launch { label, geometry, pins, .. } = launch;
        let func = self.func;
        let library = Arc::clone(&self.library);

        tracing::trace!(
            kernel.name = %self.name,
            kernel.num_args = addresses.len(),
            elements = geometry.elements,
            groups = geometry.groups,
            group_size = geometry.group_size,
            "encoding cpu kernel"
        );

        let work: CpuWork = Box::new(move || {
            let _resident = (pins, library);
            let args: SmallVec<[*mut u8; 4]> = addresses.iter().map(|&address| address as *mut u8).collect();
            for group in 0..geometry.groups {
                let vars = [geometry.elements as i64, group as i64, geometry.group_size as i64];
                // SAFETY: every address points into a pinned buffer of at least
                // `elements` values, and the kernel masks workers past the end.
                let status = unsafe { func(args.as_ptr(), vars.as_ptr()) };
                if status != 0 {
                    return Err(format!("kernel returned status {status} in group {group}"));
                }
            }
            Ok(())
        });

        stream.enqueue(label, work).context(DeviceSnafu)
    }
}
