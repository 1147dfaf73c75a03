//! Dispatch of binary elementwise kernels.
//!
//! [`Dispatcher::dispatch_binary_elementwise`] validates the operands,
//! resolves the kernel library and pipeline through the caches, allocates the
//! output through the host framework, and submits one launch onto the
//! device's framework stream. It returns as soon as the launch is submitted;
//! the output's contents become defined when the stream reaches it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_device::{Buffer, BufferOptions, Device, DeviceRegistry, Fence, Stream, SubmissionLabel};
use once_cell::sync::OnceCell;
use snafu::{ResultExt, ensure};

use crate::backend_registry::BackendRegistry;
use crate::config::RuntimeConfig;
use crate::error::{
    DTypeMismatchSnafu, DeviceMismatchSnafu, DeviceSnafu, LibraryDeviceMismatchSnafu, Result, ShapeMismatchSnafu,
};
use crate::geometry::LaunchGeometry;
use crate::kernel::{KernelSignature, Launch, Pipeline};
use crate::kernel_cache::{LibraryCache, LibraryId, PipelineCache};

/// Library and pipeline caches plus the registries they resolve through.
///
/// The global instance ([`dispatcher`]) serves the registered operators.
/// Separate instances have separate caches.
#[derive(Debug)]
pub struct Dispatcher {
    devices: Arc<DeviceRegistry>,
    backends: BackendRegistry,
    libraries: LibraryCache,
    pipelines: PipelineCache,
}

impl Dispatcher {
    pub fn new(devices: Arc<DeviceRegistry>, backends: BackendRegistry) -> Self {
        Self { devices, backends, libraries: LibraryCache::new(), pipelines: PipelineCache::new() }
    }

    /// Dispatcher over the global device registry with the built-in backends.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::new(Arc::clone(forge_device::registry()), BackendRegistry::new(config))
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.backends.config()
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn libraries(&self) -> &LibraryCache {
        &self.libraries
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Location of the packaged kernel library for `device`.
    pub fn packaged_library(&self, device: &forge_dtype::DeviceSpec) -> Result<PathBuf> {
        let backend = self.backends.get(device)?;
        Ok(self.config().library_path(backend.library_extension()))
    }

    /// `output[i] = a[i] + b[i]` with the `add_tensors` kernel of the library at `path`.
    pub fn dispatch_binary_elementwise(&self, a: &Buffer, b: &Buffer, kernel_library_path: &Path) -> Result<Buffer> {
        self.dispatch_binary(&KernelSignature::add_tensors(), a, b, kernel_library_path)
    }

    /// `add_tensors` with the packaged kernel library.
    pub fn add_tensors(&self, a: &Buffer, b: &Buffer) -> Result<Buffer> {
        validate_operands(a, b)?;
        let path = self.packaged_library(&a.device())?;
        self.dispatch_binary(&KernelSignature::add_tensors(), a, b, &path)
    }

    /// Submit the binary elementwise kernel described by `signature`.
    ///
    /// Every argument error is reported before anything is allocated or
    /// submitted. Faults during execution surface when the output is first
    /// read on the host.
    pub fn dispatch_binary(
        &self,
        signature: &KernelSignature,
        a: &Buffer,
        b: &Buffer,
        kernel_library_path: &Path,
    ) -> Result<Buffer> {
        validate_operands(a, b)?;

        let device = self.devices.get(&a.device()).context(DeviceSnafu)?;
        let entry = signature.entry_point(a.dtype());
        let pipeline = self.resolve_pipeline(&device, kernel_library_path, &entry)?;

        let output =
            Buffer::allocate(Arc::clone(&device.allocator), a.dtype(), a.shape().to_vec(), BufferOptions::default())
                .context(DeviceSnafu)?;

        let Some(geometry) = LaunchGeometry::for_elements(a.numel(), pipeline.max_group_size()) else {
            tracing::trace!(kernel.name = %entry, "empty operands, nothing to launch");
            return Ok(output);
        };

        let producers: Vec<Fence> = [a, b].iter().filter_map(|input| input.pending_write()).collect();
        for producer in &producers {
            join_foreign_producer(producer, &device.stream)?;
        }

        let args = signature.bind(a.device_view(), b.device_view(), output.device_view());
        let label = SubmissionLabel::new(signature.operator(), entry.as_str());
        let launch = Launch {
            label: label.clone(),
            args: &args,
            geometry,
            pins: vec![a.clone(), b.clone(), output.clone()],
        };
        let ticket = pipeline.encode(device.stream.as_ref(), launch)?;

        let fence = Fence::new(Arc::clone(&device.stream), ticket, label);
        a.record_read(fence.clone());
        b.record_read(fence.clone());
        output.record_write(fence.with_producers(producers));

        tracing::debug!(
            kernel.name = %entry,
            device = %device.spec,
            ticket,
            elements = geometry.elements,
            groups = geometry.groups,
            group_size = geometry.group_size,
            "kernel submitted"
        );
        Ok(output)
    }

    /// Cached pipeline for `entry` in the library at `path` on `device`.
    pub fn resolve_pipeline(&self, device: &Device, path: &Path, entry: &str) -> Result<Arc<dyn Pipeline>> {
        let backend = self.backends.get(&device.spec)?;
        let id = LibraryId::resolve(device.spec, path)?;
        ensure!(
            id.path.extension().is_some_and(|ext| ext == backend.library_extension()),
            LibraryDeviceMismatchSnafu { path, device: device.spec, expected: backend.library_extension() }
        );

        let library = self.libraries.get_or_try_init(id.clone(), || backend.load_library(device, &id.path))?;
        self.pipelines.get_or_try_init((id, entry.to_string()), || library.pipeline(entry))
    }
}

/// Check that `a` and `b` can meet in one elementwise kernel.
pub fn validate_operands(a: &Buffer, b: &Buffer) -> Result<()> {
    let (lhs, rhs) = (a.device(), b.device());
    ensure!(lhs == rhs, DeviceMismatchSnafu { lhs, rhs });
    let (lhs, rhs) = (a.numel(), b.numel());
    ensure!(lhs == rhs, ShapeMismatchSnafu { lhs, rhs });
    let (lhs, rhs) = (a.dtype(), b.dtype());
    ensure!(lhs == rhs, DTypeMismatchSnafu { lhs, rhs });
    Ok(())
}

/// Stream order covers producers on `stream` itself. Contents produced on
/// any other stream must be complete, and fault-free, before the launch is
/// queued.
fn join_foreign_producer(producer: &Fence, stream: &Arc<dyn Stream>) -> Result<()> {
    if !std::ptr::addr_eq(Arc::as_ptr(producer.stream()), Arc::as_ptr(stream)) {
        tracing::debug!(ticket = producer.ticket(), "joining producer on a foreign stream");
        producer.wait().context(DeviceSnafu)?;
    }
    Ok(())
}

static DISPATCHER: OnceCell<Dispatcher> = OnceCell::new();

/// The process-wide dispatcher, configured from the environment on first use.
pub fn dispatcher() -> Result<&'static Dispatcher> {
    DISPATCHER.get_or_try_init(|| RuntimeConfig::from_env().map(Dispatcher::with_config))
}

/// [`Dispatcher::dispatch_binary_elementwise`] on the global dispatcher.
pub fn dispatch_binary_elementwise(a: &Buffer, b: &Buffer, kernel_library_path: &Path) -> Result<Buffer> {
    dispatcher()?.dispatch_binary_elementwise(a, b, kernel_library_path)
}
