//! Dynamic memory subsystem: four layers initialized in strict order
//! at boot — physmap, then PMM, then SLAB, then the kernel VMM, then
//! the kernel HEAP. Each layer only depends on the ones before it.

pub mod error;
pub mod heap;
pub mod lock;
pub mod physmap;
pub mod pmm;
pub mod slab;
pub mod traits;
pub mod vmm;

pub use error::{MmError, MmResult};

/// Brings up PMM, SLAB, the kernel address space, and the kernel heap
/// over a single usable physical region, in the order the layers
/// require. `reserved`, if given, is carved out of the PMM's free
/// space immediately after `pmm::init` — e.g. the kernel image and
/// any boot modules loaded inside the managed range. Intended to run
/// once, early in `kernel_main`.
pub fn init_kernel_layers(phys_start: u64, phys_end: u64, reserved: Option<(u64, u64)>) -> MmResult<()> {
    pmm::init(phys_start, phys_end, physmap::PAGE_SIZE)?;
    if let Some((start, end)) = reserved {
        pmm::mark_reserved(start, end)?;
    }
    slab::init()?;
    vmm::kernel_init()?;
    heap::kernel_init()?;
    Ok(())
}
