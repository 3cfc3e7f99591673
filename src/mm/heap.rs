//! Multi-arena boundary-tagged heap, the top of the stack.
//!
//! Each arena is one VM allocation, carved into boundary-tagged
//! blocks (header + payload + footer). Free blocks from every arena
//! share a single free list, kept sorted ascending by size, so
//! first-fit and best-fit coincide heap-wide: the first block found
//! is the smallest one that fits, whichever arena it lives in.
//! Arena control structures live in a fixed table rather than on the
//! heap they describe, for the obvious reason.

use crate::mm::error::{MmError, MmResult};
use crate::mm::lock::IrqLock;
use crate::mm::physmap::align_up;
use crate::mm::traits::{PhysAlloc, VirtSpace};
use crate::mm::vmm::{self, FLAG_WRITE};

const BLOCK_MAGIC: u32 = 0xB10C_B10C;
const HEADER_SIZE: u64 = 16;
const FOOTER_SIZE: u64 = 16;
const MIN_BLOCK_SIZE: u64 = 64;
const DEFAULT_ARENA_SIZE: u64 = 1 << 20;
const MAX_ARENAS: usize = 32;
const MAX_HEAPS: usize = 4;
const KERNEL_HEAP: usize = 0;
const NONE_IDX: u32 = u32::MAX;

#[repr(C)]
struct BlockTag {
    magic: u32,
    free: u32,
    size: u64,
}

struct FreeLinks {
    prev: Option<u64>,
    next: Option<u64>,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct HeapStats {
    pub arena_count: u32,
    pub free_bytes: u64,
    pub alloc_bytes: u64,
}

struct Arena {
    base: u64,
    length: u64,
    free_bytes: u64,
    alloc_bytes: u64,
    next: u32,
}

struct HeapState {
    arenas: [Option<Arena>; MAX_ARENAS],
    first_arena: u32,
    arena_count: u32,
    /// Head of the heap-wide free list, sorted ascending by block
    /// size. Shared across every arena in this heap so a search never
    /// picks an oversized block from one arena while an exact fit
    /// sits in another.
    free_list: Option<u64>,
}

lazy_static::lazy_static! {
    static ref HEAPS: IrqLock<[Option<HeapState>; MAX_HEAPS]> =
        IrqLock::new(core::array::from_fn(|_| None));
}

pub struct AsVirtSpace<'a> {
    pub as_id: usize,
    pub phys: &'a dyn PhysAlloc,
}

impl VirtSpace for AsVirtSpace<'_> {
    fn vm_alloc(&self, length: u64, writable: bool) -> MmResult<u64> {
        let flags = if writable { FLAG_WRITE } else { 0 };
        vmm::alloc(self.as_id, length, flags, self.phys)
    }

    fn vm_free(&self, virt: u64) -> MmResult<()> {
        vmm::free(self.as_id, virt, self.phys)
    }
}

fn read_tag(addr: u64) -> BlockTag {
    unsafe { core::ptr::read(addr as *const BlockTag) }
}

fn write_tag(addr: u64, tag: &BlockTag) {
    unsafe {
        core::ptr::write(
            addr as *mut BlockTag,
            BlockTag {
                magic: tag.magic,
                free: tag.free,
                size: tag.size,
            },
        )
    }
}

fn footer_addr(block_addr: u64, size: u64) -> u64 {
    block_addr + size - FOOTER_SIZE
}

fn write_block(addr: u64, size: u64, free: bool) {
    let tag = BlockTag { magic: BLOCK_MAGIC, free: free as u32, size };
    write_tag(addr, &tag);
    write_tag(footer_addr(addr, size), &tag);
}

fn links_addr(block_addr: u64) -> u64 {
    block_addr + HEADER_SIZE
}

fn read_links(block_addr: u64) -> FreeLinks {
    let addr = links_addr(block_addr);
    let prev = unsafe { core::ptr::read((addr) as *const u64) };
    let next = unsafe { core::ptr::read((addr + 8) as *const u64) };
    FreeLinks {
        prev: if prev == 0 { None } else { Some(prev) },
        next: if next == 0 { None } else { Some(next) },
    }
}

fn write_links(block_addr: u64, links: &FreeLinks) {
    let addr = links_addr(block_addr);
    unsafe {
        core::ptr::write(addr as *mut u64, links.prev.unwrap_or(0));
        core::ptr::write((addr + 8) as *mut u64, links.next.unwrap_or(0));
    }
}

fn list_insert_sorted(state: &mut HeapState, block_addr: u64, size: u64) {
    let mut prev: Option<u64> = None;
    let mut cursor = state.free_list;
    while let Some(addr) = cursor {
        let tag = read_tag(addr);
        if tag.size >= size {
            break;
        }
        prev = Some(addr);
        cursor = read_links(addr).next;
    }

    write_links(block_addr, &FreeLinks { prev, next: cursor });
    match prev {
        Some(p) => {
            let mut l = read_links(p);
            l.next = Some(block_addr);
            write_links(p, &l);
        }
        None => state.free_list = Some(block_addr),
    }
    if let Some(n) = cursor {
        let mut l = read_links(n);
        l.prev = Some(block_addr);
        write_links(n, &l);
    }
}

fn list_remove(state: &mut HeapState, block_addr: u64) {
    let links = read_links(block_addr);
    match links.prev {
        Some(p) => {
            let mut l = read_links(p);
            l.next = links.next;
            write_links(p, &l);
        }
        None => state.free_list = links.next,
    }
    if let Some(n) = links.next {
        let mut l = read_links(n);
        l.prev = links.prev;
        write_links(n, &l);
    }
}

/// Walks the heap-wide free list for the first block big enough. The
/// list is sorted ascending by size, so the first hit is also the
/// smallest one that fits, across every arena.
fn find_fit(state: &HeapState, total_size: u64) -> Option<u64> {
    let mut cursor = state.free_list;
    while let Some(addr) = cursor {
        let tag = read_tag(addr);
        if tag.size >= total_size {
            return Some(addr);
        }
        cursor = read_links(addr).next;
    }
    None
}

fn split_if_worthwhile(state: &mut HeapState, block_addr: u64, block_size: u64, needed: u64) -> u64 {
    let remainder = block_size - needed;
    if remainder < MIN_BLOCK_SIZE {
        return block_size;
    }
    write_block(block_addr, needed, false);
    let remainder_addr = block_addr + needed;
    write_block(remainder_addr, remainder, true);
    list_insert_sorted(state, remainder_addr, remainder);
    needed
}

/// Coalesces `block_addr` with free neighbors within
/// `[arena_base, arena_base + arena_length)`, returning the (possibly
/// widened) block's new address and size. The block at `block_addr`
/// must not currently be in the free list.
fn coalesce(state: &mut HeapState, arena_base: u64, arena_length: u64, mut block_addr: u64, mut size: u64) -> (u64, u64) {
    let arena_end = arena_base + arena_length;

    let right_addr = block_addr + size;
    if right_addr < arena_end {
        let right = read_tag(right_addr);
        if right.magic == BLOCK_MAGIC && right.free != 0 {
            list_remove(state, right_addr);
            size += right.size;
        }
    }

    if block_addr > arena_base {
        let left_footer = read_tag(block_addr - FOOTER_SIZE);
        if left_footer.magic == BLOCK_MAGIC && left_footer.free != 0 {
            let left_addr = block_addr - left_footer.size;
            if left_addr >= arena_base {
                list_remove(state, left_addr);
                block_addr = left_addr;
                size += left_footer.size;
            }
        }
    }

    (block_addr, size)
}

fn new_arena(state: &mut HeapState, virt: &dyn VirtSpace, min_size: u64) -> MmResult<usize> {
    let slot = (0..MAX_ARENAS).find(|&i| state.arenas[i].is_none()).ok_or(MmError::NoMemory)?;
    let length = align_up(min_size.max(DEFAULT_ARENA_SIZE), 4096);
    let base = virt.vm_alloc(length, true)?;

    write_block(base, length, true);
    let arena = Arena {
        base,
        length,
        free_bytes: length,
        alloc_bytes: 0,
        next: state.first_arena,
    };
    state.arenas[slot] = Some(arena);
    list_insert_sorted(state, base, length);
    state.first_arena = slot as u32;
    state.arena_count += 1;
    Ok(slot)
}

fn total_size_for(payload: u64) -> u64 {
    let raw = HEADER_SIZE + FOOTER_SIZE + payload;
    align_up(raw, 8).max(MIN_BLOCK_SIZE)
}

fn with_heap<R>(heap_id: usize, f: impl FnOnce(&mut HeapState) -> MmResult<R>) -> MmResult<R> {
    let mut guard = HEAPS.lock();
    let heap = guard.get_mut(heap_id).and_then(|h| h.as_mut()).ok_or(MmError::NotInit)?;
    f(heap)
}

fn malloc_in(state: &mut HeapState, virt: &dyn VirtSpace, size: u64) -> MmResult<u64> {
    let total_size = total_size_for(size);

    let block_addr = match find_fit(state, total_size) {
        Some(addr) => addr,
        None => {
            new_arena(state, virt, total_size)?;
            find_fit(state, total_size).ok_or(MmError::NoMemory)?
        }
    };

    let arena_idx = find_owning_arena(state, block_addr).ok_or(MmError::Corruption)?;
    let block_size = read_tag(block_addr).size;
    list_remove(state, block_addr);
    let final_size = split_if_worthwhile(state, block_addr, block_size, total_size);
    write_block(block_addr, final_size, false);
    let arena = state.arenas[arena_idx].as_mut().unwrap();
    arena.free_bytes -= final_size;
    arena.alloc_bytes += final_size;

    Ok(block_addr + HEADER_SIZE)
}

fn maybe_release_arena(state: &mut HeapState, virt: &dyn VirtSpace, arena_idx: usize) {
    let (fully_free, next, base) = {
        let arena = state.arenas[arena_idx].as_ref().unwrap();
        let tag = read_tag(arena.base);
        let fully_free = arena.alloc_bytes == 0 && tag.free != 0 && tag.size == arena.length;
        (fully_free, arena.next, arena.base)
    };
    if !fully_free || state.arena_count <= 1 {
        return;
    }

    let other_free: u64 = state
        .arenas
        .iter()
        .enumerate()
        .filter(|(i, a)| *i != arena_idx && a.is_some())
        .map(|(_, a)| a.as_ref().unwrap().free_bytes)
        .sum();
    let other_alloc: u64 = state
        .arenas
        .iter()
        .enumerate()
        .filter(|(i, a)| *i != arena_idx && a.is_some())
        .map(|(_, a)| a.as_ref().unwrap().alloc_bytes)
        .sum();

    if other_alloc != 0 && other_free < 4 * other_alloc {
        return;
    }

    // Unlink from the intrusive arena chain before dropping it.
    if state.first_arena == arena_idx as u32 {
        state.first_arena = next;
    } else {
        let mut cursor = state.first_arena;
        while cursor != NONE_IDX {
            let candidate_next = state.arenas[cursor as usize].as_ref().unwrap().next;
            if candidate_next == arena_idx as u32 {
                state.arenas[cursor as usize].as_mut().unwrap().next = next;
                break;
            }
            cursor = candidate_next;
        }
    }

    list_remove(state, base);
    state.arenas[arena_idx] = None;
    state.arena_count -= 1;
    let _ = virt.vm_free(base);
}

fn free_in(state: &mut HeapState, virt: &dyn VirtSpace, ptr: u64) -> MmResult<()> {
    let block_addr = ptr - HEADER_SIZE;
    let tag = read_tag(block_addr);
    if tag.magic != BLOCK_MAGIC || tag.free != 0 {
        return Err(MmError::Corruption);
    }

    let arena_idx = find_owning_arena(state, block_addr).ok_or(MmError::NotFound)?;
    let (arena_base, arena_length) = {
        let arena = state.arenas[arena_idx].as_mut().unwrap();
        arena.alloc_bytes -= tag.size;
        (arena.base, arena.length)
    };

    let (final_addr, final_size) = coalesce(state, arena_base, arena_length, block_addr, tag.size);
    write_block(final_addr, final_size, true);
    list_insert_sorted(state, final_addr, final_size);
    state.arenas[arena_idx].as_mut().unwrap().free_bytes += final_size;

    maybe_release_arena(state, virt, arena_idx);
    Ok(())
}

fn find_owning_arena(state: &HeapState, block_addr: u64) -> Option<usize> {
    state.arenas.iter().position(|a| {
        a.as_ref().map(|a| block_addr >= a.base && block_addr < a.base + a.length).unwrap_or(false)
    })
}

pub fn kernel_init() -> MmResult<()> {
    let mut guard = HEAPS.lock();
    if guard[KERNEL_HEAP].is_some() {
        return Err(MmError::AlreadyInit);
    }
    guard[KERNEL_HEAP] = Some(HeapState {
        arenas: core::array::from_fn(|_| None),
        first_arena: NONE_IDX,
        arena_count: 0,
        free_list: None,
    });
    drop(guard);

    let virt = AsVirtSpace { as_id: vmm::kernel_as_id(), phys: &vmm::RealPmm };
    with_heap(KERNEL_HEAP, |state| {
        new_arena(state, &virt, DEFAULT_ARENA_SIZE)?;
        Ok(())
    })
}

pub fn create(virt: &dyn VirtSpace) -> MmResult<usize> {
    let mut guard = HEAPS.lock();
    let slot = (1..MAX_HEAPS).find(|&i| guard[i].is_none()).ok_or(MmError::NoMemory)?;
    guard[slot] = Some(HeapState {
        arenas: core::array::from_fn(|_| None),
        first_arena: NONE_IDX,
        arena_count: 0,
        free_list: None,
    });
    drop(guard);

    with_heap(slot, |state| {
        new_arena(state, virt, DEFAULT_ARENA_SIZE)?;
        Ok(())
    })?;
    Ok(slot)
}

pub fn destroy(heap_id: usize, virt: &dyn VirtSpace) -> MmResult<()> {
    if heap_id == KERNEL_HEAP {
        return Err(MmError::Invalid);
    }
    let mut guard = HEAPS.lock();
    let state = guard.get_mut(heap_id).and_then(|h| h.take()).ok_or(MmError::NotFound)?;
    for arena in state.arenas.into_iter().flatten() {
        let _ = virt.vm_free(arena.base);
    }
    Ok(())
}

pub fn malloc(heap_id: usize, virt: &dyn VirtSpace, size: u64) -> MmResult<u64> {
    if size == 0 {
        return Err(MmError::BadSize);
    }
    with_heap(heap_id, |state| malloc_in(state, virt, size))
}

/// # Safety
/// `ptr` must have come from [`malloc`]/[`calloc`]/[`realloc`] on this
/// heap and not already have been freed.
pub unsafe fn free(heap_id: usize, virt: &dyn VirtSpace, ptr: u64) -> MmResult<()> {
    with_heap(heap_id, |state| free_in(state, virt, ptr))
}

pub fn calloc(heap_id: usize, virt: &dyn VirtSpace, count: u64, size: u64) -> MmResult<u64> {
    let total = count.checked_mul(size).ok_or(MmError::Invalid)?;
    let ptr = malloc(heap_id, virt, total)?;
    unsafe {
        core::ptr::write_bytes(ptr as *mut u8, 0, total as usize);
    }
    Ok(ptr)
}

/// # Safety
/// `ptr` must have come from this heap, or be zero (treated as malloc).
pub unsafe fn realloc(heap_id: usize, virt: &dyn VirtSpace, ptr: u64, new_size: u64) -> MmResult<u64> {
    if ptr == 0 {
        return malloc(heap_id, virt, new_size);
    }
    if new_size == 0 {
        free(heap_id, virt, ptr)?;
        return Ok(0);
    }

    let block_addr = ptr - HEADER_SIZE;
    let old_tag = read_tag(block_addr);
    if old_tag.magic != BLOCK_MAGIC || old_tag.free != 0 {
        return Err(MmError::Corruption);
    }
    let new_total = total_size_for(new_size);

    if new_total <= old_tag.size {
        return with_heap(heap_id, |state| {
            let arena_idx = find_owning_arena(state, block_addr).ok_or(MmError::NotFound)?;
            let final_size = split_if_worthwhile(state, block_addr, old_tag.size, new_total);
            write_block(block_addr, final_size, false);
            let shrunk_by = old_tag.size - final_size;
            let arena = state.arenas[arena_idx].as_mut().unwrap();
            arena.alloc_bytes -= shrunk_by;
            arena.free_bytes += shrunk_by;
            Ok(ptr)
        });
    }

    let grown_in_place = with_heap(heap_id, |state| {
        let arena_idx = find_owning_arena(state, block_addr).ok_or(MmError::NotFound)?;
        let arena_end = {
            let arena = state.arenas[arena_idx].as_ref().unwrap();
            arena.base + arena.length
        };
        let right_addr = block_addr + old_tag.size;
        if right_addr >= arena_end {
            return Ok(None);
        }
        let right = read_tag(right_addr);
        if right.magic != BLOCK_MAGIC || right.free == 0 {
            return Ok(None);
        }
        let combined = old_tag.size + right.size;
        if combined < new_total {
            return Ok(None);
        }

        list_remove(state, right_addr);
        write_block(block_addr, combined, false);
        let final_size = split_if_worthwhile(state, block_addr, combined, new_total);
        write_block(block_addr, final_size, false);
        let remainder = combined - final_size;
        let arena = state.arenas[arena_idx].as_mut().unwrap();
        arena.alloc_bytes = arena.alloc_bytes - old_tag.size + final_size;
        arena.free_bytes = arena.free_bytes - right.size + remainder;
        Ok(Some(ptr))
    })?;

    if let Some(ptr) = grown_in_place {
        return Ok(ptr);
    }

    let old_payload = old_tag.size - HEADER_SIZE - FOOTER_SIZE;
    let new_ptr = malloc(heap_id, virt, new_size)?;
    core::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, old_payload.min(new_size) as usize);
    free(heap_id, virt, ptr)?;
    Ok(new_ptr)
}

pub fn get_alloc_size(ptr: u64) -> MmResult<u64> {
    let block_addr = ptr - HEADER_SIZE;
    let tag = read_tag(block_addr);
    if tag.magic != BLOCK_MAGIC || tag.free != 0 {
        return Err(MmError::Invalid);
    }
    Ok(tag.size - HEADER_SIZE - FOOTER_SIZE)
}

pub fn stats(heap_id: usize) -> MmResult<HeapStats> {
    with_heap(heap_id, |state| {
        let mut free_bytes = 0;
        let mut alloc_bytes = 0;
        for arena in state.arenas.iter().flatten() {
            free_bytes += arena.free_bytes;
            alloc_bytes += arena.alloc_bytes;
        }
        Ok(HeapStats { arena_count: state.arena_count, free_bytes, alloc_bytes })
    })
}

pub fn check_integrity(heap_id: usize) -> MmResult<bool> {
    with_heap(heap_id, |state| {
        for arena in state.arenas.iter().flatten() {
            let mut cursor = arena.base;
            let mut total = 0u64;
            while cursor < arena.base + arena.length {
                let tag = read_tag(cursor);
                if tag.magic != BLOCK_MAGIC {
                    return Ok(false);
                }
                let footer = read_tag(footer_addr(cursor, tag.size));
                if footer.magic != BLOCK_MAGIC || footer.size != tag.size || footer.free != tag.free {
                    return Ok(false);
                }
                total += tag.size;
                cursor += tag.size;
            }
            if total != arena.length {
                return Ok(false);
            }
        }

        // The free list is shared heap-wide: walk it once, checking
        // ascending size order and doubly-linked consistency rather
        // than per arena. A bound on the walk catches a cyclic list
        // that corruption could otherwise turn into a hang.
        let max_steps = state.arenas.iter().flatten().map(|a| a.length / MIN_BLOCK_SIZE).sum::<u64>() + 1;
        let mut steps = 0u64;
        let mut prev_addr: Option<u64> = None;
        let mut prev_size = 0u64;
        let mut cursor = state.free_list;
        while let Some(addr) = cursor {
            steps += 1;
            if steps > max_steps {
                return Ok(false);
            }
            let tag = read_tag(addr);
            if tag.magic != BLOCK_MAGIC || tag.free == 0 {
                return Ok(false);
            }
            if tag.size < prev_size {
                return Ok(false);
            }
            let links = read_links(addr);
            if links.prev != prev_addr {
                return Ok(false);
            }
            prev_addr = Some(addr);
            prev_size = tag.size;
            cursor = links.next;
        }

        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm;
    use crate::mm::slab;
    use crate::mm::traits::mock::MockPhysAlloc;

    fn setup() -> MockPhysAlloc {
        use std::alloc::{alloc as host_alloc, Layout};
        let layout = Layout::from_size_align(16 * 1024 * 1024, 4096).unwrap();
        let ptr = unsafe { host_alloc(layout) };
        assert!(!ptr.is_null());
        let start = ptr as u64;
        let _ = pmm::init(start, start + 16 * 1024 * 1024, 4096);
        let _ = slab::init();
        let _ = vmm::kernel_init();
        MockPhysAlloc::new()
    }

    #[test]
    fn malloc_free_roundtrip() {
        let mock = setup();
        let virt = AsVirtSpace { as_id: vmm::kernel_as_id(), phys: &mock };
        kernel_init().unwrap();

        let a = malloc(KERNEL_HEAP, &virt, 128).unwrap();
        let b = malloc(KERNEL_HEAP, &virt, 256).unwrap();
        assert_ne!(a, b);
        unsafe {
            free(KERNEL_HEAP, &virt, a).unwrap();
            free(KERNEL_HEAP, &virt, b).unwrap();
        }
        assert!(check_integrity(KERNEL_HEAP).unwrap());
    }

    #[test]
    fn free_list_stays_sorted_and_coalesces() {
        let mock = setup();
        let virt = AsVirtSpace { as_id: vmm::kernel_as_id(), phys: &mock };
        kernel_init().unwrap();

        let mut ptrs = vec![];
        for _ in 0..16 {
            ptrs.push(malloc(KERNEL_HEAP, &virt, 64).unwrap());
        }
        for p in ptrs {
            unsafe { free(KERNEL_HEAP, &virt, p).unwrap() };
        }

        let stats = stats(KERNEL_HEAP).unwrap();
        assert_eq!(stats.alloc_bytes, 0);
        assert!(check_integrity(KERNEL_HEAP).unwrap());
    }

    #[test]
    fn realloc_grows_in_place_when_adjacent_free() {
        let mock = setup();
        let virt = AsVirtSpace { as_id: vmm::kernel_as_id(), phys: &mock };
        kernel_init().unwrap();

        let a = malloc(KERNEL_HEAP, &virt, 64).unwrap();
        let b = malloc(KERNEL_HEAP, &virt, 64).unwrap();
        unsafe { free(KERNEL_HEAP, &virt, b).unwrap() };

        let grown = unsafe { realloc(KERNEL_HEAP, &virt, a, 96).unwrap() };
        assert_eq!(grown, a);
        assert!(check_integrity(KERNEL_HEAP).unwrap());
    }

    #[test]
    fn detects_double_free() {
        let mock = setup();
        let virt = AsVirtSpace { as_id: vmm::kernel_as_id(), phys: &mock };
        kernel_init().unwrap();

        let a = malloc(KERNEL_HEAP, &virt, 64).unwrap();
        unsafe {
            free(KERNEL_HEAP, &virt, a).unwrap();
            assert_eq!(free(KERNEL_HEAP, &virt, a), Err(MmError::Corruption));
        }
    }
}
