//! Kernel backends per device type.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
