//! Thin wrappers around the primitives the memory subsystem's
//! interrupt-safe locks and boot sequence need.
//!
//! Under `cfg(test)` this crate builds for the host, where `cli`/`sti`
//! are privileged instructions that would fault in ring 3. The mm/
//! unit tests run single-threaded with no real interrupts to mask, so
//! the test build stubs these out instead of executing them.

#[cfg(not(test))]
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
pub fn halt_loop() -> ! {
    unreachable!("halt_loop should not be called from host tests")
}

/// Returns whether interrupts were enabled before this call, then
/// disables them. Pairs with [`restore_interrupts`].
#[cfg(not(test))]
#[inline]
pub fn disable_interrupts_save() -> bool {
    use x86_64::instructions::interrupts;
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    were_enabled
}

#[cfg(test)]
#[inline]
pub fn disable_interrupts_save() -> bool {
    false
}

#[cfg(not(test))]
#[inline]
pub fn restore_interrupts(were_enabled: bool) {
    use x86_64::instructions::interrupts;
    if were_enabled {
        interrupts::enable();
    }
}

#[cfg(test)]
#[inline]
pub fn restore_interrupts(_were_enabled: bool) {}

/// Loads `phys` (a PML4 physical address) into CR3, switching the
/// active address space. The host test build never calls this: VMM
/// unit tests only exercise the page-table walk through physmap, not
/// an actual CPU translation.
#[cfg(not(test))]
#[inline]
pub fn load_page_table(phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let frame = PhysFrame::containing_address(PhysAddr::new(phys));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(test)]
#[inline]
pub fn load_page_table(_phys: u64) {}

/// Invalidates the TLB entry for `virt` via `invlpg`. Must follow any
/// PTE mutation (unmap, remap with new flags) that targets the
/// currently loaded address space. The host test build never calls
/// this: VMM unit tests only exercise the page-table walk through
/// physmap, never a live CPU translation.
#[cfg(not(test))]
#[inline]
pub fn flush_tlb_page(virt: u64) {
    use x86_64::instructions::tlb;
    use x86_64::VirtAddr;

    tlb::flush(VirtAddr::new(virt));
}

#[cfg(test)]
#[inline]
pub fn flush_tlb_page(_virt: u64) {}
