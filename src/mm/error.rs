//! Error taxonomy shared by every layer (PMM, SLAB, VMM, HEAP).
//!
//! One enum covers the "programmer error / resource exhaustion /
//! integrity / misc" groups the spec describes per-layer; each layer
//! only ever produces the subset relevant to it.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmError {
    Invalid,
    NotInit,
    AlreadyInit,
    NotAligned,
    OutOfRange,
    AlreadyMapped,
    NotFound,
    Oom,
    NoMemory,
    CacheFull,
    VmmFail,
    Corruption,
    BadSize,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MmError::Invalid => "invalid argument",
            MmError::NotInit => "layer not initialized",
            MmError::AlreadyInit => "layer already initialized",
            MmError::NotAligned => "address/size not aligned",
            MmError::OutOfRange => "address outside managed range",
            MmError::AlreadyMapped => "virtual page already mapped",
            MmError::NotFound => "object/allocation not found",
            MmError::Oom => "out of memory (no free block of required order)",
            MmError::NoMemory => "backing allocator exhausted",
            MmError::CacheFull => "slab cache exhausted",
            MmError::VmmFail => "virtual memory manager operation failed",
            MmError::Corruption => "corruption detected (magic or red zone mismatch)",
            MmError::BadSize => "requested size not supported by this allocator",
        };
        f.write_str(s)
    }
}

pub type MmResult<T> = Result<T, MmError>;
