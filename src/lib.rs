#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod bootinfo;
pub mod interrupts;
pub mod logger;
pub mod mm;
pub mod serial;
pub mod vga_buffer;

use core::panic::PanicInfo;
use multiboot2::{BootInformation, BootInformationHeader};

pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BADB002; // Multiboot v1
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d7_6289; // Multiboot v2

/// Picks the largest `Available` region reported by the bootloader and
/// brings up the four memory layers over it. The kernel image and any
/// loaded modules are carved out first so PMM never hands out frames
/// still holding code or initrd bytes.
fn bring_up_memory(boot_info: &BootInformation<'_>) -> mm::MmResult<()> {
    let mut best: Option<(u64, u64)> = None;
    bootinfo::for_each_usable_region(boot_info, |start, end| {
        let better = match best {
            Some((s, e)) => (end - start) > (e - s),
            None => true,
        };
        if better {
            best = Some((start, end));
        }
    });

    let (region_start, region_end) = best.ok_or(mm::MmError::NoMemory)?;
    let reserve_end = bootinfo::modules_end(boot_info).max(region_start);
    let reserved = if reserve_end > region_start {
        Some((region_start, reserve_end.min(region_end)))
    } else {
        None
    };

    mm::init_kernel_layers(region_start, region_end, reserved)
}

pub fn kernel_main(multiboot_info_address: u64, magic: u32) -> ! {
    let freq_hz = logger::init();
    vga_buffer::init();
    arch::init_gdt();
    interrupts::init();

    kinfo!("memkern bootstrap start");
    kdebug!("Multiboot magic: {:#x}", magic);
    kdebug!("Multiboot info struct at: {:#x}", multiboot_info_address);

    if logger::tsc_frequency_is_guessed() {
        kwarn!(
            "Falling back to default TSC frequency: {}.{:03} MHz",
            freq_hz / 1_000_000,
            (freq_hz % 1_000_000) / 1_000
        );
    } else {
        kinfo!(
            "Detected invariant TSC frequency: {}.{:03} MHz",
            freq_hz / 1_000_000,
            (freq_hz % 1_000_000) / 1_000
        );
    }

    if magic != MULTIBOOT2_BOOTLOADER_MAGIC && magic != MULTIBOOT_BOOTLOADER_MAGIC {
        kerror!("Invalid Multiboot magic value: {:#x}", magic);
        arch::halt_loop();
    }

    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        kwarn!("Multiboot v1 detected; memory subsystem requires Multiboot2.");
        arch::halt_loop();
    }

    let boot_info = unsafe {
        BootInformation::load(multiboot_info_address as *const BootInformationHeader)
            .expect("valid multiboot info structure")
    };

    bootinfo::log_memory_overview(&boot_info);

    match bring_up_memory(&boot_info) {
        Ok(()) => kinfo!("[mm] PMM, SLAB, kernel VMM and kernel HEAP online"),
        Err(e) => {
            kfatal!("[mm] memory subsystem bring-up failed: {}", e);
            arch::halt_loop();
        }
    }

    if let Ok(stats) = mm::pmm::stats() {
        kinfo!(
            "[mm] PMM: {} KiB free / {} KiB allocated",
            stats.free_bytes / 1024,
            stats.allocated_bytes / 1024
        );
    }
    if let Ok(stats) = mm::heap::stats(0) {
        kinfo!(
            "[mm] kernel HEAP: {} arena(s), {} KiB free, {} KiB allocated",
            stats.arena_count,
            stats.free_bytes / 1024,
            stats.alloc_bytes / 1024
        );
    }

    let elapsed_us = logger::boot_time_us();
    kinfo!(
        "Kernel initialization completed in {}.{:03} ms",
        elapsed_us / 1_000,
        elapsed_us % 1_000
    );

    kinfo!("System halted awaiting next stage.");
    arch::halt_loop()
}

pub fn panic(info: &PanicInfo) -> ! {
    kfatal!("KERNEL PANIC: {}", info);
    arch::halt_loop()
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::vga_buffer::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {{
        $crate::vga_buffer::_print(format_args!($($arg)*));
        $crate::vga_buffer::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Trace, $($arg)*);
    }};
}

/// Backs `alloc::*` (`Vec`, `Box`, ...) with the kernel heap once it's
/// online. Never installed in the host test build, which keeps std's
/// allocator.
#[cfg(not(test))]
struct KernelHeapAllocator;

#[cfg(not(test))]
unsafe impl core::alloc::GlobalAlloc for KernelHeapAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        let virt = mm::heap::AsVirtSpace { as_id: mm::vmm::kernel_as_id(), phys: &mm::vmm::RealPmm };
        match mm::heap::malloc(0, &virt, layout.size() as u64) {
            Ok(ptr) => ptr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        let virt = mm::heap::AsVirtSpace { as_id: mm::vmm::kernel_as_id(), phys: &mm::vmm::RealPmm };
        let _ = mm::heap::free(0, &virt, ptr as u64);
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelHeapAllocator = KernelHeapAllocator;
