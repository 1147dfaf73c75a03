//! Element types and device identities.
//!
//! Both the host-side tensor storage and the kernel entry-point naming key off
//! [`DType`], so this crate sits at the bottom of the dependency graph.

use std::fmt;

pub mod ext;


/// Element type of a flat device buffer.
///
/// The `Display` form is the short mnemonic used as the element-type suffix
/// of kernel entry points (`add_tensors_v1_f32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::IntoStaticStr, strum::EnumIter)]
#[cfg_attr(any(test, feature = "proptest"), derive(proptest_derive::Arbitrary))]
pub enum DType {
    #[strum(serialize = "bool")]
    Bool,

    #[strum(serialize = "i8")]
    Int8,
    #[strum(serialize = "u8")]
    UInt8,
    #[strum(serialize = "i16")]
    Int16,
    #[strum(serialize = "u16")]
    UInt16,
    #[strum(serialize = "i32")]
    Int32,
    #[strum(serialize = "u32")]
    UInt32,
    #[strum(serialize = "i64")]
    Int64,
    #[strum(serialize = "u64")]
    UInt64,

    #[strum(serialize = "f16")]
    Float16,
    #[strum(serialize = "bf16")]
    BFloat16,
    #[strum(serialize = "f32")]
    Float32,
    #[strum(serialize = "f64")]
    Float64,
}

impl DType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    /// Entry-point suffix, same as the `Display` form.
    pub fn short_name(&self) -> &'static str {
        self.into()
    }
}

/// Identity of a compute device.
///
/// Two buffers may only meet in one kernel invocation if their specs compare
/// equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceSpec {
    /// Host memory with the reference worker stream.
    Cpu,
    /// CUDA device by ordinal.
    Cuda { device_id: usize },
}

impl DeviceSpec {
    /// Device type without the ordinal ("CPU", "CUDA").
    pub const fn base_type(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Cuda { .. } => "CUDA",
        }
    }

    /// Canonical string form, the inverse of `DeviceSpecExt::parse`.
    pub fn canonicalize(&self) -> String {
        match self {
            Self::Cpu => "CPU".to_string(),
            Self::Cuda { device_id } => format!("CUDA:{device_id}"),
        }
    }

    pub const fn is_gpu(&self) -> bool {
        matches!(self, Self::Cuda { .. })
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonicalize())
    }
}
