use forge_device::{DeviceHandle, DeviceView};
use forge_dtype::{DType, DeviceSpec};
use test_case::test_case;

use crate::{Binding, ErrorKind, KernelSignature};

fn view(handle: u64) -> DeviceView {
    DeviceView { device: DeviceSpec::Cpu, handle: DeviceHandle(handle), offset: 0, len: 4, dtype: DType::Float32 }
}

#[test_case(DType::Float32, "add_tensors_v1_f32")]
#[test_case(DType::Float64, "add_tensors_v1_f64")]
#[test_case(DType::Int32, "add_tensors_v1_i32")]
#[test_case(DType::Int64, "add_tensors_v1_i64")]
fn test_entry_point_names(dtype: DType, expected: &str) {
    assert_eq!(KernelSignature::add_tensors().entry_point(dtype), expected);
}

#[test]
fn test_versioned_entry_point() {
    assert_eq!(KernelSignature::new("mul_tensors", 3).entry_point(DType::UInt8), "mul_tensors_v3_u8");
}

#[test]
fn test_default_binding_order() {
    let [first, second, third] = KernelSignature::add_tensors().bind(view(1), view(2), view(3));
    assert_eq!((first.handle.0, second.handle.0, third.handle.0), (1, 2, 3));
}

#[test]
fn test_custom_binding_order() {
    let signature = KernelSignature::add_tensors()
        .with_bindings([Binding::Output, Binding::Input0, Binding::Input1])
        .unwrap();
    let [first, second, third] = signature.bind(view(1), view(2), view(3));
    assert_eq!((first.handle.0, second.handle.0, third.handle.0), (3, 1, 2));
}

#[test]
fn test_bindings_must_be_a_permutation() {
    let error = KernelSignature::add_tensors()
        .with_bindings([Binding::Input0, Binding::Input0, Binding::Output])
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);
}
