//! Virtual memory manager: per-address-space page tables and the
//! bookkeeping of which virtual ranges are in use.
//!
//! The 4-level walk operates purely through the physmap — a page
//! table is just a page of 512 `u64` entries like any other PMM page
//! — so the same walker runs unmodified against the host-identity
//! physmap used by unit tests and the real one used at boot.

use crate::mm::error::{MmError, MmResult};
use crate::mm::lock::IrqLock;
use crate::mm::physmap::{align_down, align_up, phys_to_ptr, PAGE_SIZE};
use crate::mm::pmm;
use crate::mm::slab::{self, CacheId};
use crate::mm::traits::PhysAlloc;

#[cfg(not(test))]
use alloc::vec;

const AS_MAGIC: u32 = 0xA5_0001;
const OBJ_MAGIC: u32 = 0x0B_0001;
const NONE_ADDR: u64 = u64::MAX;
const MAX_AS: usize = 16;
const ENTRIES_PER_TABLE: u64 = 512;
const USER_HALF_ENTRIES: u64 = 256;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub const FLAG_WRITE: u32 = 1 << 0;
pub const FLAG_USER: u32 = 1 << 1;
pub const FLAG_EXEC: u32 = 1 << 2;
pub const FLAG_MMIO: u32 = 1 << 3;

const KERNEL_ALLOC_BASE: u64 = 0xFFFF_FFFF_A000_0000;
const KERNEL_ALLOC_END: u64 = 0xFFFF_FFFF_C000_0000;

#[repr(C)]
struct VmNode {
    magic: u32,
    flags: u32,
    base: u64,
    length: u64,
    next: u64,
}

struct AddressSpace {
    magic: u32,
    pt_root_phys: u64,
    objects: Option<u64>,
    alloc_base: u64,
    alloc_end: u64,
    is_kernel: bool,
}

const KERNEL_AS: usize = 0;

lazy_static::lazy_static! {
    static ref AS_TABLE: IrqLock<[Option<AddressSpace>; MAX_AS]> =
        IrqLock::new(core::array::from_fn(|_| None));
}

static NODE_CACHE: IrqLock<Option<CacheId>> = IrqLock::new(None);

pub struct RealPmm;

impl PhysAlloc for RealPmm {
    fn phys_alloc(&self, size: u64) -> MmResult<u64> {
        pmm::alloc(size)
    }

    fn phys_free(&self, phys: u64, size: u64) {
        pmm::free(phys, size)
    }
}

fn node_cache() -> MmResult<CacheId> {
    let mut guard = NODE_CACHE.lock();
    if let Some(id) = *guard {
        return Ok(id);
    }
    let id = slab::cache_create("vm-node", core::mem::size_of::<VmNode>(), 8)?;
    *guard = Some(id);
    Ok(id)
}

fn read_node(phys: u64) -> VmNode {
    unsafe { core::ptr::read(phys_to_ptr::<VmNode>(phys)) }
}

fn write_node(phys: u64, node: &VmNode) {
    unsafe {
        core::ptr::write(
            phys_to_ptr::<VmNode>(phys),
            VmNode {
                magic: node.magic,
                flags: node.flags,
                base: node.base,
                length: node.length,
                next: node.next,
            },
        )
    }
}

fn read_entry(table_phys: u64, index: u64) -> u64 {
    unsafe { core::ptr::read(phys_to_ptr::<u64>(table_phys + index * 8)) }
}

fn write_entry(table_phys: u64, index: u64, value: u64) {
    unsafe { core::ptr::write(phys_to_ptr::<u64>(table_phys + index * 8), value) }
}

fn table_indices(virt: u64) -> [u64; 4] {
    [
        (virt >> 39) & 0x1FF,
        (virt >> 30) & 0x1FF,
        (virt >> 21) & 0x1FF,
        (virt >> 12) & 0x1FF,
    ]
}

fn zero_table(phys: u64) {
    for i in 0..ENTRIES_PER_TABLE {
        write_entry(phys, i, 0);
    }
}

/// Returns the physical address of the table one level down from
/// `parent_phys` at `index`, creating it (via the PMM) if absent and
/// `create` is set.
fn get_or_create_table(parent_phys: u64, index: u64, create: bool, set_user: bool) -> MmResult<u64> {
    let entry = read_entry(parent_phys, index);
    if entry & PTE_PRESENT != 0 {
        return Ok(entry & PTE_ADDR_MASK);
    }
    if !create {
        return Err(MmError::NotFound);
    }

    let child = pmm::alloc_page()?;
    zero_table(child);
    let mut flags = PTE_PRESENT | PTE_WRITABLE;
    if set_user {
        flags |= PTE_USER;
    }
    write_entry(parent_phys, index, child | flags);
    Ok(child)
}

fn translate_pte_flags(flags: u32) -> u64 {
    let mut pte = PTE_PRESENT;
    if flags & FLAG_WRITE != 0 {
        pte |= PTE_WRITABLE;
    }
    if flags & FLAG_USER != 0 {
        pte |= PTE_USER;
    }
    if flags & FLAG_EXEC == 0 {
        pte |= PTE_NX;
    }
    pte
}

fn walk(pt_root_phys: u64, virt: u64, create: bool, set_user: bool) -> MmResult<u64> {
    if !crate::mm::physmap::is_page_aligned(virt) {
        return Err(MmError::NotAligned);
    }
    let indices = table_indices(virt);
    let mut table = pt_root_phys;
    for &index in &indices[..3] {
        table = get_or_create_table(table, index, create, set_user)?;
    }
    Ok(table + indices[3] * 8)
}

fn map_page_in(pt_root_phys: u64, virt: u64, phys: u64, flags: u32) -> MmResult<()> {
    let set_user = flags & FLAG_USER != 0;
    let entry_addr = walk(pt_root_phys, virt, true, set_user)?;
    let table_phys = align_down(entry_addr, PAGE_SIZE);
    let index = (entry_addr - table_phys) / 8;
    let existing = read_entry(table_phys, index);
    if existing & PTE_PRESENT != 0 {
        return Err(MmError::AlreadyMapped);
    }
    write_entry(table_phys, index, (phys & PTE_ADDR_MASK) | translate_pte_flags(flags));
    Ok(())
}

fn unmap_page_in(pt_root_phys: u64, virt: u64) -> MmResult<u64> {
    let entry_addr = match walk(pt_root_phys, virt, false, false) {
        Ok(a) => a,
        Err(MmError::NotFound) => return Err(MmError::NotFound),
        Err(e) => return Err(e),
    };
    let table_phys = align_down(entry_addr, PAGE_SIZE);
    let index = (entry_addr - table_phys) / 8;
    let existing = read_entry(table_phys, index);
    if existing & PTE_PRESENT == 0 {
        return Err(MmError::NotFound);
    }
    write_entry(table_phys, index, 0);
    crate::arch::x86_64::flush_tlb_page(virt);
    Ok(existing & PTE_ADDR_MASK)
}

fn get_physical_in(pt_root_phys: u64, virt: u64) -> MmResult<u64> {
    let page = align_down(virt, PAGE_SIZE);
    let offset = virt - page;
    let entry_addr = walk(pt_root_phys, page, false, false)?;
    let table_phys = align_down(entry_addr, PAGE_SIZE);
    let index = (entry_addr - table_phys) / 8;
    let existing = read_entry(table_phys, index);
    if existing & PTE_PRESENT == 0 {
        return Err(MmError::NotFound);
    }
    Ok((existing & PTE_ADDR_MASK) + offset)
}

/// Finds the lowest gap in `[alloc_base, alloc_end)` at least
/// `length` bytes wide, given the ascending sorted object list.
fn find_gap(objects_head: Option<u64>, alloc_base: u64, alloc_end: u64, length: u64) -> MmResult<u64> {
    let mut cursor = alloc_base;
    let mut node = objects_head;
    loop {
        let next_obj_base = match node {
            Some(phys) => read_node(phys).base,
            None => alloc_end,
        };
        if next_obj_base.saturating_sub(cursor) >= length {
            return Ok(cursor);
        }
        match node {
            Some(phys) => {
                let n = read_node(phys);
                cursor = n.base + n.length;
                node = if n.next == NONE_ADDR { None } else { Some(n.next) };
            }
            None => return Err(MmError::NoMemory),
        }
    }
}

fn insert_sorted(as_: &mut AddressSpace, base: u64, length: u64, flags: u32) -> MmResult<()> {
    let cache = node_cache()?;
    let node_phys = crate::mm::physmap::virt_to_phys(slab::alloc(cache)? as u64);
    write_node(
        node_phys,
        &VmNode {
            magic: OBJ_MAGIC,
            flags,
            base,
            length,
            next: NONE_ADDR,
        },
    );

    let mut prev: Option<u64> = None;
    let mut cursor = as_.objects;
    while let Some(phys) = cursor {
        let n = read_node(phys);
        if n.base > base {
            break;
        }
        prev = Some(phys);
        cursor = if n.next == NONE_ADDR { None } else { Some(n.next) };
    }

    let mut new_node = read_node(node_phys);
    new_node.next = cursor.unwrap_or(NONE_ADDR);
    write_node(node_phys, &new_node);

    match prev {
        Some(p) => {
            let mut ph = read_node(p);
            ph.next = node_phys;
            write_node(p, &ph);
        }
        None => as_.objects = Some(node_phys),
    }
    Ok(())
}

fn remove_node(as_: &mut AddressSpace, base: u64) -> MmResult<VmNode> {
    let mut prev: Option<u64> = None;
    let mut cursor = as_.objects;
    while let Some(phys) = cursor {
        let n = read_node(phys);
        if n.base == base {
            let next = if n.next == NONE_ADDR { None } else { Some(n.next) };
            match prev {
                Some(p) => {
                    let mut ph = read_node(p);
                    ph.next = next.unwrap_or(NONE_ADDR);
                    write_node(p, &ph);
                }
                None => as_.objects = next,
            }
            let cache = node_cache()?;
            unsafe {
                let _ = slab::free(cache, phys_to_ptr::<u8>(phys));
            }
            return Ok(n);
        }
        prev = Some(phys);
        cursor = if n.next == NONE_ADDR { None } else { Some(n.next) };
    }
    Err(MmError::NotFound)
}

fn find_node(as_: &AddressSpace, virt: u64) -> Option<VmNode> {
    let mut cursor = as_.objects;
    while let Some(phys) = cursor {
        let n = read_node(phys);
        if virt >= n.base && virt < n.base + n.length {
            return Some(n);
        }
        cursor = if n.next == NONE_ADDR { None } else { Some(n.next) };
    }
    None
}

pub fn kernel_init() -> MmResult<()> {
    let mut guard = AS_TABLE.lock();
    if guard[KERNEL_AS].is_some() {
        return Err(MmError::AlreadyInit);
    }
    let pt_root_phys = pmm::alloc_page()?;
    zero_table(pt_root_phys);
    guard[KERNEL_AS] = Some(AddressSpace {
        magic: AS_MAGIC,
        pt_root_phys,
        objects: None,
        alloc_base: KERNEL_ALLOC_BASE,
        alloc_end: KERNEL_ALLOC_END,
        is_kernel: true,
    });
    Ok(())
}

/// Creates a new address space whose top half (PML4 entries 256..511)
/// is copied by value from the kernel's, so every AS shares the same
/// kernel mappings without ever mutating them from user-AS teardown.
pub fn create(alloc_base: u64, alloc_end: u64) -> MmResult<usize> {
    let mut guard = AS_TABLE.lock();
    let kernel_root = guard[KERNEL_AS].as_ref().ok_or(MmError::NotInit)?.pt_root_phys;

    let slot = (1..MAX_AS).find(|&i| guard[i].is_none()).ok_or(MmError::NoMemory)?;
    let pt_root_phys = pmm::alloc_page()?;
    zero_table(pt_root_phys);
    for index in USER_HALF_ENTRIES..ENTRIES_PER_TABLE {
        let entry = read_entry(kernel_root, index);
        write_entry(pt_root_phys, index, entry);
    }

    guard[slot] = Some(AddressSpace {
        magic: AS_MAGIC,
        pt_root_phys,
        objects: None,
        alloc_base,
        alloc_end,
        is_kernel: false,
    });
    Ok(slot)
}

pub fn destroy(as_id: usize, phys: &dyn PhysAlloc) -> MmResult<()> {
    let mut guard = AS_TABLE.lock();
    let mut as_ = guard.get_mut(as_id).and_then(|a| a.take()).ok_or(MmError::NotFound)?;
    if as_.is_kernel {
        guard[as_id] = Some(as_);
        return Err(MmError::Invalid);
    }

    let mut objects = vec![];
    let mut cursor = as_.objects;
    while let Some(p) = cursor {
        let n = read_node(p);
        objects.push((n.base, n.length, n.flags));
        cursor = if n.next == NONE_ADDR { None } else { Some(n.next) };
    }

    for (base, length, flags) in objects {
        free_locked(&mut as_, base, length, flags, phys)?;
    }

    // Only the user half (indices 0..256) was ever populated by this
    // AS; the shared kernel half must not be torn down here.
    free_subtree(as_.pt_root_phys, 3, 0, USER_HALF_ENTRIES);
    pmm::free_page(as_.pt_root_phys);
    Ok(())
}

fn free_subtree(table_phys: u64, level: u32, start: u64, end: u64) {
    for index in start..end {
        let entry = read_entry(table_phys, index);
        if entry & PTE_PRESENT == 0 {
            continue;
        }
        let child = entry & PTE_ADDR_MASK;
        if level > 1 {
            free_subtree(child, level - 1, 0, ENTRIES_PER_TABLE);
        }
        pmm::free_page(child);
    }
}

pub fn switch(as_id: usize) -> MmResult<()> {
    let guard = AS_TABLE.lock();
    let as_ = guard.get(as_id).and_then(|a| a.as_ref()).ok_or(MmError::NotFound)?;
    crate::arch::x86_64::load_page_table(as_.pt_root_phys);
    Ok(())
}

fn with_as<R>(as_id: usize, f: impl FnOnce(&mut AddressSpace) -> MmResult<R>) -> MmResult<R> {
    let mut guard = AS_TABLE.lock();
    let as_ = guard.get_mut(as_id).and_then(|a| a.as_mut()).ok_or(MmError::NotFound)?;
    if as_.magic != AS_MAGIC {
        return Err(MmError::Corruption);
    }
    f(as_)
}

pub fn alloc(as_id: usize, length: u64, flags: u32, phys: &dyn PhysAlloc) -> MmResult<u64> {
    let length = align_up(length, PAGE_SIZE);
    with_as(as_id, |as_| {
        let base = find_gap(as_.objects, as_.alloc_base, as_.alloc_end, length)?;

        let pages = length / PAGE_SIZE;
        let mut mapped: u64 = 0;
        let mut result: MmResult<()> = Ok(());
        for i in 0..pages {
            let virt = base + i * PAGE_SIZE;
            let frame = match phys.phys_alloc(PAGE_SIZE) {
                Ok(f) => f,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if let Err(e) = map_page_in(as_.pt_root_phys, virt, frame, flags) {
                phys.phys_free(frame, PAGE_SIZE);
                result = Err(e);
                break;
            }
            mapped += 1;
        }

        if let Err(e) = result {
            for i in 0..mapped {
                let virt = base + i * PAGE_SIZE;
                if let Ok(frame) = unmap_page_in(as_.pt_root_phys, virt) {
                    phys.phys_free(frame, PAGE_SIZE);
                }
            }
            return Err(e);
        }

        insert_sorted(as_, base, length, flags)?;
        Ok(base)
    })
}

/// Same as [`alloc`], but the caller fixes the virtual address. With
/// `FLAG_MMIO` set in `flags`, `phys_base` is taken as the caller's
/// fixed physical backing (e.g. a device BAR) and mapped directly,
/// never touching `phys`. Otherwise `phys_base` is ignored and each
/// page is backed by a fresh PMM frame, exactly like `alloc`, just at
/// a caller-chosen base instead of one found via gap search.
pub fn alloc_at(as_id: usize, virt: u64, phys_base: u64, length: u64, flags: u32, phys: &dyn PhysAlloc) -> MmResult<()> {
    if !crate::mm::physmap::is_page_aligned(virt) {
        return Err(MmError::NotAligned);
    }
    let is_mmio = flags & FLAG_MMIO != 0;
    if is_mmio && !crate::mm::physmap::is_page_aligned(phys_base) {
        return Err(MmError::NotAligned);
    }
    let length = align_up(length, PAGE_SIZE);

    with_as(as_id, |as_| {
        if find_node(as_, virt).is_some() {
            return Err(MmError::AlreadyMapped);
        }

        let pages = length / PAGE_SIZE;
        let mut mapped = 0u64;
        let mut result: MmResult<()> = Ok(());
        for i in 0..pages {
            let page_virt = virt + i * PAGE_SIZE;
            let frame = if is_mmio {
                phys_base + i * PAGE_SIZE
            } else {
                match phys.phys_alloc(PAGE_SIZE) {
                    Ok(f) => f,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            };
            if let Err(e) = map_page_in(as_.pt_root_phys, page_virt, frame, flags) {
                if !is_mmio {
                    phys.phys_free(frame, PAGE_SIZE);
                }
                result = Err(e);
                break;
            }
            mapped += 1;
        }

        if let Err(e) = result {
            for j in 0..mapped {
                let page_virt = virt + j * PAGE_SIZE;
                if let Ok(frame) = unmap_page_in(as_.pt_root_phys, page_virt) {
                    if !is_mmio {
                        phys.phys_free(frame, PAGE_SIZE);
                    }
                }
            }
            return Err(e);
        }

        insert_sorted(as_, virt, length, flags)
    })
}

fn free_locked(as_: &mut AddressSpace, base: u64, length: u64, flags: u32, phys: &dyn PhysAlloc) -> MmResult<()> {
    let pages = length / PAGE_SIZE;
    for i in 0..pages {
        let virt = base + i * PAGE_SIZE;
        match unmap_page_in(as_.pt_root_phys, virt) {
            Ok(frame) => {
                if flags & FLAG_MMIO == 0 {
                    phys.phys_free(frame, PAGE_SIZE);
                }
            }
            Err(MmError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn free(as_id: usize, virt: u64, phys: &dyn PhysAlloc) -> MmResult<()> {
    with_as(as_id, |as_| {
        let node = find_node(as_, virt).ok_or(MmError::NotFound)?;
        if node.base != virt {
            return Err(MmError::Invalid);
        }
        free_locked(as_, node.base, node.length, node.flags, phys)?;
        remove_node(as_, node.base)?;
        Ok(())
    })
}

pub fn resize(as_id: usize, virt: u64, new_length: u64, flags: u32, phys: &dyn PhysAlloc) -> MmResult<()> {
    let new_length = align_up(new_length, PAGE_SIZE);
    with_as(as_id, |as_| {
        let node = find_node(as_, virt).ok_or(MmError::NotFound)?;
        if node.base != virt {
            return Err(MmError::Invalid);
        }
        if new_length == node.length {
            return Ok(());
        }

        if new_length < node.length {
            let shrink_from = virt + new_length;
            let shrink_len = node.length - new_length;
            free_locked(as_, shrink_from, shrink_len, node.flags, phys)?;
        } else {
            let grow_len = new_length - node.length;
            let grow_from = virt + node.length;
            let gap_end = match find_node_after(as_, grow_from) {
                Some(next_base) => next_base,
                None => as_.alloc_end,
            };
            if gap_end - grow_from < grow_len {
                return Err(MmError::NoMemory);
            }
            let pages = grow_len / PAGE_SIZE;
            let mut mapped = 0u64;
            let mut result: MmResult<()> = Ok(());
            for i in 0..pages {
                let target = grow_from + i * PAGE_SIZE;
                let frame = match phys.phys_alloc(PAGE_SIZE) {
                    Ok(f) => f,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                };
                if let Err(e) = map_page_in(as_.pt_root_phys, target, frame, flags) {
                    phys.phys_free(frame, PAGE_SIZE);
                    result = Err(e);
                    break;
                }
                mapped += 1;
            }

            if let Err(e) = result {
                for j in 0..mapped {
                    let target = grow_from + j * PAGE_SIZE;
                    if let Ok(frame) = unmap_page_in(as_.pt_root_phys, target) {
                        phys.phys_free(frame, PAGE_SIZE);
                    }
                }
                return Err(e);
            }
        }

        remove_node(as_, node.base)?;
        insert_sorted(as_, virt, new_length, flags)
    })
}

fn find_node_after(as_: &AddressSpace, addr: u64) -> Option<u64> {
    let mut cursor = as_.objects;
    while let Some(phys) = cursor {
        let n = read_node(phys);
        if n.base >= addr {
            return Some(n.base);
        }
        cursor = if n.next == NONE_ADDR { None } else { Some(n.next) };
    }
    None
}

pub fn protect(as_id: usize, virt: u64, new_flags: u32) -> MmResult<()> {
    with_as(as_id, |as_| {
        let node = find_node(as_, virt).ok_or(MmError::NotFound)?;
        if node.base != virt {
            return Err(MmError::Invalid);
        }
        let pages = node.length / PAGE_SIZE;
        let effective_flags = if node.flags & FLAG_MMIO != 0 {
            new_flags | FLAG_MMIO
        } else {
            new_flags
        };
        for i in 0..pages {
            let page_virt = virt + i * PAGE_SIZE;
            let frame = get_physical_in(as_.pt_root_phys, page_virt)?;
            unmap_page_in(as_.pt_root_phys, page_virt)?;
            map_page_in(as_.pt_root_phys, page_virt, frame, effective_flags)?;
        }
        remove_node(as_, node.base)?;
        insert_sorted(as_, node.base, node.length, effective_flags)
    })
}

pub fn map_page(as_id: usize, virt: u64, phys: u64, flags: u32) -> MmResult<()> {
    with_as(as_id, |as_| map_page_in(as_.pt_root_phys, virt, phys, flags))
}

pub fn unmap_page(as_id: usize, virt: u64) -> MmResult<u64> {
    with_as(as_id, |as_| unmap_page_in(as_.pt_root_phys, virt))
}

pub fn get_physical(as_id: usize, virt: u64) -> MmResult<u64> {
    with_as(as_id, |as_| get_physical_in(as_.pt_root_phys, virt))
}

pub fn find_object(as_id: usize, virt: u64) -> MmResult<(u64, u64, u32)> {
    with_as(as_id, |as_| {
        find_node(as_, virt).map(|n| (n.base, n.length, n.flags)).ok_or(MmError::NotFound)
    })
}

pub const fn kernel_as_id() -> usize {
    KERNEL_AS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::traits::mock::MockPhysAlloc;

    fn setup() -> (MockPhysAlloc, usize) {
        use std::alloc::{alloc as host_alloc, Layout};
        let layout = Layout::from_size_align(8 * 1024 * 1024, 4096).unwrap();
        let ptr = unsafe { host_alloc(layout) };
        assert!(!ptr.is_null());
        let start = ptr as u64;
        let _ = pmm::init(start, start + 8 * 1024 * 1024, PAGE_SIZE);
        let _ = slab::init();

        let mock = MockPhysAlloc::new();
        kernel_init().unwrap();
        (mock, kernel_as_id())
    }

    #[test]
    fn alloc_free_roundtrip() {
        let (mock, as_id) = setup();
        let virt = alloc(as_id, PAGE_SIZE * 4, FLAG_WRITE, &mock).unwrap();
        assert!(get_physical(as_id, virt).is_ok());
        free(as_id, virt, &mock).unwrap();
        assert_eq!(get_physical(as_id, virt), Err(MmError::NotFound));
    }

    #[test]
    fn allocations_do_not_overlap() {
        let (mock, as_id) = setup();
        let a = alloc(as_id, PAGE_SIZE * 2, FLAG_WRITE, &mock).unwrap();
        let b = alloc(as_id, PAGE_SIZE * 2, FLAG_WRITE, &mock).unwrap();
        assert!(a + PAGE_SIZE * 2 <= b || b + PAGE_SIZE * 2 <= a);
    }

    #[test]
    fn translation_matches_mapping() {
        let (mock, as_id) = setup();
        let virt = alloc(as_id, PAGE_SIZE, FLAG_WRITE, &mock).unwrap();
        let phys = get_physical(as_id, virt).unwrap();
        assert_eq!(phys % PAGE_SIZE, 0);
    }

    #[test]
    fn find_object_reports_flags() {
        let (mock, as_id) = setup();
        let virt = alloc(as_id, PAGE_SIZE, FLAG_WRITE | FLAG_EXEC, &mock).unwrap();
        let (base, length, flags) = find_object(as_id, virt).unwrap();
        assert_eq!(base, virt);
        assert_eq!(length, PAGE_SIZE);
        assert_eq!(flags, FLAG_WRITE | FLAG_EXEC);
    }
}
