//! Dispatch of prebuilt custom kernels.
//!
//! The runtime connects three things it does not own: tensors and streams of
//! the host framework (`forge_device`), kernel library artifacts produced by
//! `forge-build`, and the device backends that load those artifacts. A
//! dispatch validates its operands, resolves a cached pipeline for a versioned
//! entry point, allocates the output through the framework, and submits one
//! launch onto the device's existing stream without waiting for it.
//!
//! ```ignore
//! let cpu = forge_device::cpu()?;
//! let a = cpu.upload(&[1.0f32, 2.0, 3.0], vec![3])?;
//! let b = cpu.upload(&[4.0f32, 5.0, 6.0], vec![3])?;
//! let c = forge_runtime::add_tensors(&a, &b)?;
//! assert_eq!(c.to_vec::<f32>()?, vec![5.0, 7.0, 9.0]);
//! ```

pub mod backend_registry;
pub mod config;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod geometry;
pub mod kernel;
pub mod kernel_cache;
pub mod ops;


pub use backend_registry::{BackendFactory, BackendRegistry};
pub use config::RuntimeConfig;
pub use devices::cpu::CpuBackend;
#[cfg(feature = "cuda")]
pub use devices::cuda::CudaBackend;
pub use dispatch::{Dispatcher, dispatch_binary_elementwise, dispatcher, validate_operands};
pub use error::{Error, ErrorKind, Result};
pub use geometry::LaunchGeometry;
pub use kernel::{Backend, Binding, KernelLibrary, KernelSignature, Launch, Pipeline};
pub use kernel_cache::{KernelCache, LibraryCache, LibraryId, PipelineCache};
pub use ops::{OPERATORS, OperatorFn, OperatorRegistry, add_tensors};
