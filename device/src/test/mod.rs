
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use forge_dtype::DeviceSpec;

use crate::allocator::{Allocator, BufferOptions, CpuAllocator, RawBuffer};
use crate::error::Result;

/// Host-memory allocator that claims to be another device and counts calls.
#[derive(Debug)]
pub struct CountingAllocator {
    pub spec: DeviceSpec,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
}

impl CountingAllocator {
    pub fn new(spec: DeviceSpec) -> Arc<Self> {
        Arc::new(Self { spec, allocs: AtomicUsize::new(0), frees: AtomicUsize::new(0) })
    }
}

impl Allocator for CountingAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        CpuAllocator.alloc(size, options)
    }

    fn free(&self, _buffer: RawBuffer) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "COUNTING"
    }

    fn device_spec(&self) -> DeviceSpec {
        self.spec
    }
}
