//! Kernel libraries, pipelines and the entry-point contract.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use forge_device::{Buffer, Device, DeviceView, Stream, SubmissionLabel, Ticket};
use forge_dtype::{DType, DeviceSpec};
use snafu::ensure;

use crate::Result;
use crate::error::InvalidSignatureSnafu;
use crate::geometry::LaunchGeometry;

/// Loads kernel library artifacts for one kind of device.
pub trait Backend: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// File extension of the artifacts this backend loads.
    fn library_extension(&self) -> &str;

    /// Load the artifact at `path` for use on `device`.
    fn load_library(&self, device: &Device, path: &Path) -> Result<Arc<dyn KernelLibrary>>;
}

/// A loaded kernel library artifact.
pub trait KernelLibrary: Send + Sync + Debug {
    fn path(&self) -> &Path;

    fn device(&self) -> DeviceSpec;

    /// Build the pipeline for one entry point.
    ///
    /// This is the expensive step (symbol resolution, and for GPUs the
    /// driver's preparation of the function); callers cache the result.
    fn pipeline(&self, entry: &str) -> Result<Arc<dyn Pipeline>>;
}

/// One invocation, ready to encode.
#[derive(Debug)]
pub struct Launch<'a> {
    pub label: SubmissionLabel,
    /// Kernel arguments in entry-point order.
    pub args: &'a [DeviceView],
    pub geometry: LaunchGeometry,
    /// Buffers that must stay alive until the work has executed.
    pub pins: Vec<Buffer>,
}

/// Ready-to-execute form of one kernel entry point.
pub trait Pipeline: Send + Sync + Debug {
    /// Entry-point name.
    fn name(&self) -> &str;

    /// Largest worker group the kernel can be launched with.
    fn max_group_size(&self) -> usize;

    /// Encode `launch` onto `stream` and return its ticket without waiting.
    fn encode(&self, stream: &dyn Stream, launch: Launch<'_>) -> Result<Ticket>;
}

/// Role of one kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Input0,
    Input1,
    Output,
}

/// Entry-point naming and argument order of a binary elementwise kernel.
///
/// Entry points are named `{operator}_v{version}_{dtype}`, for example
/// `add_tensors_v1_f32`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSignature {
    operator: String,
    version: u32,
    bindings: [Binding; 3],
}

impl KernelSignature {
    pub const DEFAULT_BINDINGS: [Binding; 3] = [Binding::Input0, Binding::Input1, Binding::Output];

    pub fn new(operator: impl Into<String>, version: u32) -> Self {
        Self { operator: operator.into(), version, bindings: Self::DEFAULT_BINDINGS }
    }

    /// Signature of the built-in `add_tensors` operator.
    pub fn add_tensors() -> Self {
        Self::new("add_tensors", 1)
    }

    /// Use a different argument order; each role must appear exactly once.
    pub fn with_bindings(mut self, bindings: [Binding; 3]) -> Result<Self> {
        for role in Self::DEFAULT_BINDINGS {
            let count = bindings.iter().filter(|&&b| b == role).count();
            ensure!(
                count == 1,
                InvalidSignatureSnafu {
                    operator: &self.operator,
                    reason: format!("{role:?} bound {count} times in {bindings:?}"),
                }
            );
        }
        self.bindings = bindings;
        Ok(self)
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn bindings(&self) -> &[Binding; 3] {
        &self.bindings
    }

    pub fn entry_point(&self, dtype: DType) -> String {
        format!("{}_v{}_{}", self.operator, self.version, dtype.short_name())
    }

    /// Arrange the operand views in entry-point order.
    pub fn bind(&self, input0: DeviceView, input1: DeviceView, output: DeviceView) -> [DeviceView; 3] {
        self.bindings.map(|binding| match binding {
            Binding::Input0 => input0,
            Binding::Input1 => input1,
            Binding::Output => output,
        })
    }
}
