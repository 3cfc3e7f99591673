//! Architecture-specific glue: GDT/TSS, interrupt handling, and the
//! small set of x86_64 primitives the memory subsystem needs directly.

pub mod gdt;
pub mod x86_64;

pub use self::x86_64::halt_loop;

pub use gdt::init as init_gdt;
