use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use forge_device::{Buffer, CpuStream, CpuTimelineSignal, Fence, Stream, SubmissionLabel, TimelineSignal};
use forge_dtype::{DType, DeviceSpec};

use crate::test::fixtures::{CountingAllocator, FakeBackend, FakeBehavior, Harness, fake_library};
use crate::{Error, ErrorKind};

#[test]
fn test_dispatch_returns_sum() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let library = fake_library();

    let a = harness.upload(&[1.0f32, 2.0, 3.0], vec![3]);
    let b = harness.upload(&[4.0f32, 5.0, 6.0], vec![3]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap();

    assert_eq!(c.device(), DeviceSpec::Cpu);
    assert_eq!(c.shape(), &[3]);
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_device_mismatch_before_allocation() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();
    let elsewhere = CountingAllocator::new(DeviceSpec::Cuda { device_id: 1 });

    let a = harness.upload(&[1.0f32; 4], vec![4]);
    let b = Buffer::from_slice(elsewhere.clone(), &[1.0f32; 4], vec![4]).unwrap();
    let allocs = harness.allocator.allocs();

    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap_err();
    assert!(matches!(
        error,
        Error::DeviceMismatch { lhs: DeviceSpec::Cpu, rhs: DeviceSpec::Cuda { device_id: 1 } }
    ));
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(harness.allocator.allocs(), allocs, "no output allocated");
    assert_eq!(elsewhere.allocs(), 1);
    assert_eq!(harness.submitted(), 0);
}

#[test]
fn test_shape_mismatch_has_no_side_effects() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let library = fake_library();

    let a = harness.upload(&[0.0f32; 6], vec![2, 3]);
    let b = harness.upload(&[0.0f32; 4], vec![4]);
    let allocs = harness.allocator.allocs();

    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap_err();
    assert!(matches!(error, Error::ShapeMismatch { lhs: 6, rhs: 4 }));
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);

    assert_eq!(harness.submitted(), 0);
    assert_eq!(harness.allocator.allocs(), allocs);
    assert_eq!(backend.loads(), 0);
    assert!(harness.dispatcher.libraries().is_empty());
    assert!(harness.dispatcher.pipelines().is_empty());
}

#[test]
fn test_equal_counts_with_different_shapes_are_accepted() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 6], vec![2, 3]);
    let b = harness.upload(&[2.0f32; 6], vec![3, 2]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap();
    assert_eq!(c.shape(), &[2, 3]);
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![3.0; 6]);
}

#[test]
fn test_dtype_mismatch() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 2], vec![2]);
    let b = harness.upload(&[1i32; 2], vec![2]);
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap_err();
    assert!(matches!(error, Error::DTypeMismatch { lhs: DType::Float32, rhs: DType::Int32 }));
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(harness.submitted(), 0);
}

#[test]
fn test_device_checked_before_count() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();
    let elsewhere = CountingAllocator::new(DeviceSpec::Cuda { device_id: 0 });

    let a = harness.upload(&[1.0f32; 2], vec![2]);
    let b = Buffer::from_slice(elsewhere, &[1i32; 3], vec![3]).unwrap();
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap_err();
    assert!(matches!(error, Error::DeviceMismatch { .. }));
}

#[test]
fn test_missing_library() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let dir = tempfile::tempdir().unwrap();

    let a = harness.upload(&[1.0f32; 2], vec![2]);
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &a, &dir.path().join("default.so")).unwrap_err();
    assert!(matches!(error, Error::LibraryNotFound { .. }));
    assert_eq!(error.kind(), ErrorKind::KernelResolution);
    assert_eq!(backend.loads(), 0);
    assert_eq!(harness.submitted(), 0);
}

#[test]
fn test_unloadable_library_is_not_cached() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("default.so");
    std::fs::write(&path, b"corrupt").unwrap();

    let a = harness.upload(&[1.0f32; 2], vec![2]);
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &a, &path).unwrap_err();
    assert!(matches!(error, Error::LibraryLoad { .. }));
    assert_eq!(error.kind(), ErrorKind::KernelResolution);
    assert!(harness.dispatcher.libraries().is_empty());

    std::fs::write(&path, b"fixed").unwrap();
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, &path).unwrap();
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![2.0, 2.0]);
    assert_eq!(backend.loads(), 2);
}

#[test]
fn test_library_for_another_device() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = tempfile::Builder::new().suffix(".cubin").tempfile().unwrap();

    let a = harness.upload(&[1.0f32; 2], vec![2]);
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap_err();
    assert!(matches!(&error, Error::LibraryDeviceMismatch { expected, .. } if expected == "so"));
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(harness.submitted(), 0);
}

#[test]
fn test_missing_entry_point() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = harness.upload(&[1.0f64; 2], vec![2]);
    let error = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap_err();
    assert!(matches!(&error, Error::SymbolNotFound { name, .. } if name == "add_tensors_v1_f64"));
    assert_eq!(error.kind(), ErrorKind::KernelResolution);
    assert_eq!(harness.submitted(), 0);
    assert!(harness.dispatcher.pipelines().is_empty());
}

#[test]
fn test_pipeline_reused_across_calls() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 8], vec![8]);
    for _ in 0..10 {
        harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();
    }

    assert_eq!(harness.submitted(), 10);
    assert_eq!(backend.loads(), 1);
    assert_eq!(backend.constructions(), 1);
    assert_eq!(harness.dispatcher.libraries().constructions(), 1);
    assert_eq!(harness.dispatcher.pipelines().constructions(), 1);
}

#[test]
fn test_pipeline_per_entry_point() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let library = fake_library();

    let f = harness.upload(&[1.0f32; 2], vec![2]);
    let i = harness.upload(&[1i32; 2], vec![2]);
    for _ in 0..3 {
        harness.dispatcher.dispatch_binary_elementwise(&f, &f, library.path()).unwrap();
        harness.dispatcher.dispatch_binary_elementwise(&i, &i, library.path()).unwrap();
    }
    assert_eq!(backend.loads(), 1);
    assert_eq!(backend.constructions(), 2);
    assert_eq!(harness.dispatcher.pipelines().len(), 2);
}

#[test]
fn test_concurrent_dispatch_constructs_one_pipeline() {
    const THREADS: usize = 8;
    let backend = FakeBackend::with_delay(FakeBehavior::Add, Duration::from_millis(50));
    let harness = Arc::new(Harness::with_backend(backend.clone()));
    let library = Arc::new(fake_library());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let (harness, library, barrier) = (Arc::clone(&harness), Arc::clone(&library), Arc::clone(&barrier));
            thread::spawn(move || {
                let a = harness.upload(&[i as f32; 16], vec![16]);
                barrier.wait();
                let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();
                (i, c.to_vec::<f32>().unwrap())
            })
        })
        .collect();

    for handle in handles {
        let (i, values) = handle.join().unwrap();
        assert_eq!(values, vec![2.0 * i as f32; 16]);
    }
    assert_eq!(backend.loads(), 1);
    assert_eq!(backend.constructions(), 1);
    assert_eq!(harness.dispatcher.pipelines().constructions(), 1);
}

#[test]
fn test_dispatch_does_not_wait() {
    let gate = Arc::new(CpuTimelineSignal::new());
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Gated(Arc::clone(&gate))));
    let library = fake_library();

    let a = harness.upload(&[1.0f32, 2.0], vec![2]);
    let b = harness.upload(&[10.0f32, 20.0], vec![2]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap();

    let fence = c.pending_write().expect("output is written by the launch");
    assert!(!fence.is_complete(), "the launch is blocked on the gate");
    assert_eq!(fence.label().operator, "add_tensors");
    assert_eq!(fence.label().kernel, "add_tensors_v1_f32");

    gate.set(1);
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![11.0, 22.0]);
}

#[test]
fn test_inputs_stay_alive_until_executed() {
    let gate = Arc::new(CpuTimelineSignal::new());
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Gated(Arc::clone(&gate))));
    let library = fake_library();

    let a = harness.upload(&[1.5f32; 32], vec![32]);
    let b = harness.upload(&[2.5f32; 32], vec![32]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &b, library.path()).unwrap();
    drop((a, b));
    assert_eq!(harness.allocator.frees(), 0, "inputs are pinned by the submission");

    gate.set(1);
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![4.0; 32]);
    harness.device.stream.synchronize().unwrap();
    // The worker drops the pins right after the work ran.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while harness.allocator.frees() < 2 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(harness.allocator.frees(), 2);
}

#[test]
fn test_fault_surfaces_when_output_is_observed() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Fault("illegal address".to_string())));
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 4], vec![4]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).expect("faults are asynchronous");

    match c.to_vec::<f32>() {
        Err(forge_device::Error::KernelExecution { operator, kernel, reason }) => {
            assert_eq!(operator, "add_tensors");
            assert_eq!(kernel, "add_tensors_v1_f32");
            assert_eq!(reason, "illegal address");
        }
        other => panic!("expected a kernel execution error, got {other:?}"),
    }

    let wrapped = crate::Error::Device { source: c.materialize().unwrap_err() };
    assert_eq!(wrapped.kind(), ErrorKind::KernelExecution);
}

#[test]
fn test_fault_does_not_poison_the_stream() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Fault("boom".to_string())));
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 4], vec![4]);
    let faulted = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();
    let fresh = harness.upload(&[3.0f32; 4], vec![4]);

    assert!(faulted.to_vec::<f32>().is_err());
    assert_eq!(fresh.to_vec::<f32>().unwrap(), vec![3.0; 4]);
}

#[test]
fn test_upstream_fault_surfaces_through_consumer() {
    let producer = Harness::with_backend(FakeBackend::new(FakeBehavior::Fault("illegal address".to_string())));
    let consumer = producer.sibling(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = producer.upload(&[1.0f32; 4], vec![4]);
    let c = producer.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();
    let d = consumer.dispatch_binary_elementwise(&c, &c, library.path()).unwrap();
    let e = consumer.dispatch_binary_elementwise(&d, &a, library.path()).unwrap();

    for derived in [&d, &e] {
        match derived.to_vec::<f32>() {
            Err(forge_device::Error::KernelExecution { reason, .. }) => assert_eq!(reason, "illegal address"),
            other => panic!("expected the producer's fault, got {other:?}"),
        }
    }
}

#[test]
fn test_clean_producers_are_not_retained() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = harness.upload(&[1.0f32; 4], vec![4]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();
    c.materialize().unwrap();
    let d = harness.dispatcher.dispatch_binary_elementwise(&c, &c, library.path()).unwrap();

    assert!(d.pending_write().unwrap().producers().is_empty());
    assert_eq!(d.to_vec::<f32>().unwrap(), vec![4.0; 4]);
}

#[test]
fn test_faulted_foreign_producer_fails_dispatch() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();
    let foreign = Arc::new(CpuStream::new().unwrap());
    let label = SubmissionLabel::new("fill", "fill_f32");

    let a = harness.upload(&[1.0f32; 4], vec![4]);
    let ticket = foreign.enqueue(label.clone(), Box::new(|| Err("unlaunchable".to_string()))).unwrap();
    a.record_write(Fence::new(foreign, ticket, label));

    let submitted = harness.submitted();
    let err = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KernelExecution);
    assert!(err.to_string().contains("fill_f32"), "{err}");
    assert_eq!(harness.submitted(), submitted);
}

#[test]
fn test_empty_operands_submit_nothing() {
    let backend = FakeBackend::new(FakeBehavior::Add);
    let harness = Harness::with_backend(backend.clone());
    let library = fake_library();

    let a = harness.upload::<f32>(&[], vec![0, 4]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();

    assert_eq!(c.shape(), &[0, 4]);
    assert_eq!(c.numel(), 0);
    assert!(c.pending_write().is_none());
    assert_eq!(harness.submitted(), 0);
    assert_eq!(c.to_vec::<f32>().unwrap(), Vec::<f32>::new());
}

#[test]
fn test_chained_dispatch_is_stream_ordered() {
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Add));
    let library = fake_library();

    let a = harness.upload(&[1.0f32, 2.0, 3.0], vec![3]);
    let mut c = a.clone();
    for _ in 0..5 {
        c = harness.dispatcher.dispatch_binary_elementwise(&c, &c, library.path()).unwrap();
    }
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![32.0, 64.0, 96.0]);
    assert_eq!(harness.submitted(), 5);
}

#[test]
fn test_copyin_waits_for_pending_reader() {
    let gate = Arc::new(CpuTimelineSignal::new());
    let harness = Harness::with_backend(FakeBackend::new(FakeBehavior::Gated(Arc::clone(&gate))));
    let library = fake_library();

    let mut a = harness.upload(&[1.0f32; 4], vec![4]);
    let c = harness.dispatcher.dispatch_binary_elementwise(&a, &a, library.path()).unwrap();

    let opener = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate.set(1);
        })
    };
    // Overwriting an input must not race the launch that reads it.
    a.copyin(bytemuck::cast_slice(&[100.0f32; 4])).unwrap();
    opener.join().unwrap();

    assert_eq!(c.to_vec::<f32>().unwrap(), vec![2.0; 4]);
    assert_eq!(a.to_vec::<f32>().unwrap(), vec![100.0; 4]);
}

