//! Multiboot2 boot-information parsing: logging the memory map and
//! handing usable regions to the PMM during bring-up, before any
//! allocator exists to hold a `Vec` of them.

use multiboot2::{BootInformation, MemoryAreaType};

pub fn log_memory_overview(boot_info: &BootInformation<'_>) {
    if let Some(memmap) = boot_info.memory_map_tag() {
        let areas = memmap.memory_areas();
        crate::kinfo!("[mem] Detected {} memory regions", areas.len());

        for area in areas.iter() {
            let start = area.start_address() as u64;
            let end = area.end_address() as u64;
            let size_kib = (area.size() / 1024).max(1);

            crate::kinfo!(
                "  - {:#012x} .. {:#012x} ({} KiB, {})",
                start,
                end,
                size_kib,
                classify_area(area.typ())
            );
        }
    } else {
        crate::kwarn!("[mem] No memory map provided by bootloader.");
    }

    let mut any_module = false;
    for module in boot_info.module_tags() {
        if !any_module {
            crate::kinfo!("[mem] Boot modules:");
            any_module = true;
        }

        let name = module.cmdline().unwrap_or("<invalid utf-8>");

        crate::kinfo!(
            "  - {:#010x} .. {:#010x} ({} bytes): {}",
            module.start_address(),
            module.end_address(),
            module.module_size(),
            name
        );
    }

    if !any_module {
        crate::kinfo!("[mem] No boot modules supplied.");
    }
}

fn classify_area(area_type: multiboot2::MemoryAreaTypeId) -> &'static str {
    match MemoryAreaType::from(area_type) {
        MemoryAreaType::Available => "Usable",
        MemoryAreaType::Reserved => "Reserved",
        MemoryAreaType::AcpiAvailable => "ACPI",
        MemoryAreaType::ReservedHibernate => "ACPI NVS",
        MemoryAreaType::Defective => "Defective",
        MemoryAreaType::Custom(_) => "Custom",
    }
}

/// Highest physical address touched by any boot module (initrd, etc).
/// The PMM must not hand out frames below this address even if the
/// memory map marks them available, since the module bytes still need
/// to be read before anything can safely reuse that memory.
pub fn modules_end(boot_info: &BootInformation<'_>) -> u64 {
    let mut max_end = 0;
    for module in boot_info.module_tags() {
        let end = module.end_address() as u64;
        if end > max_end {
            max_end = end;
        }
    }
    max_end
}

/// Invokes `f(start, end)` for every `Available` region in the memory
/// map, in ascending address order as reported by the bootloader, with
/// low memory below 1 MiB skipped (it holds BIOS data structures and
/// the VGA buffer, neither of which the memory map always marks
/// reserved).
pub fn for_each_usable_region(boot_info: &BootInformation<'_>, mut f: impl FnMut(u64, u64)) {
    let Some(memmap) = boot_info.memory_map_tag() else {
        return;
    };

    for area in memmap.memory_areas() {
        if area.typ() != MemoryAreaType::Available {
            continue;
        }
        let start = area.start_address() as u64;
        let end = area.end_address() as u64;
        if end <= 0x100000 {
            continue;
        }
        let start = start.max(0x100000);
        if start < end {
            f(start, end);
        }
    }
}
