use crate::*;
use proptest::prelude::*;

pub fn int_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::Int8),
        Just(DType::Int16),
        Just(DType::Int32),
        Just(DType::Int64),
        Just(DType::UInt8),
        Just(DType::UInt16),
        Just(DType::UInt32),
        Just(DType::UInt64),
    ]
}

pub fn float_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::Float16), Just(DType::BFloat16), Just(DType::Float32), Just(DType::Float64)]
}

/// Element types the shipped `add_tensors` kernels are instantiated for.
pub fn kernel_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::Int32), Just(DType::Int64), Just(DType::Float32), Just(DType::Float64)]
}

pub fn device_generator() -> impl Strategy<Value = DeviceSpec> {
    prop_oneof![Just(DeviceSpec::Cpu), (0usize..8).prop_map(|device_id| DeviceSpec::Cuda { device_id })]
}
