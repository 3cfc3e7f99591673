//! Capability seams between layers. Each real layer implements the
//! capability the layer above it consumes, so tests can swap in a
//! double for one layer while exercising the real code in the layer
//! above it.

use crate::mm::error::MmResult;

/// What SLAB and VMM need from a physical-frame source.
pub trait PhysAlloc {
    /// Allocates a physically contiguous region of exactly `size`
    /// bytes (already rounded to the allocator's granularity by the
    /// caller) and returns its physical base address.
    fn phys_alloc(&self, size: u64) -> MmResult<u64>;
    fn phys_free(&self, phys: u64, size: u64);
}

/// What HEAP needs from a virtual-memory source: one allocation per
/// arena, released as a unit.
pub trait VirtSpace {
    fn vm_alloc(&self, length: u64, writable: bool) -> MmResult<u64>;
    fn vm_free(&self, virt: u64) -> MmResult<()>;
}

/// What the VMM and HEAP use to obtain their own control-structure
/// nodes (vm-objects, arena/block descriptors) once SLAB is online.
pub trait SlabBackend {
    /// # Safety
    /// Returned pointer is valid for `size` bytes until freed via
    /// [`SlabBackend::slab_free`] on the same backend.
    unsafe fn slab_alloc(&self, size: usize, align: usize) -> MmResult<*mut u8>;
    /// # Safety
    /// `ptr` must have come from [`SlabBackend::slab_alloc`] on this
    /// backend with the same `size`/`align`.
    unsafe fn slab_free(&self, ptr: *mut u8, size: usize, align: usize);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Stands in for the PMM in VMM unit tests: "physical" addresses
    /// are really host heap pointers, reached the same way real
    /// physical addresses are — through a fixed offset.
    pub struct MockPhysAlloc {
        live: Mutex<HashMap<u64, (usize, usize)>>,
    }

    impl MockPhysAlloc {
        pub fn new() -> Self {
            Self {
                live: Mutex::new(HashMap::new()),
            }
        }
    }

    impl PhysAlloc for MockPhysAlloc {
        fn phys_alloc(&self, size: u64) -> MmResult<u64> {
            let layout = Layout::from_size_align(size as usize, 4096).map_err(|_| crate::mm::error::MmError::Invalid)?;
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                return Err(crate::mm::error::MmError::Oom);
            }
            let phys = ptr as u64;
            self.live.lock().unwrap().insert(phys, (size as usize, 4096));
            Ok(phys)
        }

        fn phys_free(&self, phys: u64, _size: u64) {
            if let Some((size, align)) = self.live.lock().unwrap().remove(&phys) {
                let layout = Layout::from_size_align(size, align).unwrap();
                unsafe { dealloc(phys as *mut u8, layout) };
            }
        }
    }
}
