//! Slab object cache, layered directly on the PMM.
//!
//! Each slab is exactly one PMM page: a header at the front, followed
//! by a run of fixed-size slots. A free slot's head carries a magic
//! value and its body doubles as the freelist link — the same
//! embedded-linked-list trick the buddy allocator uses one layer down,
//! applied at object instead of page granularity. A tail magic past
//! the caller's bytes catches small overruns on free.

use crate::mm::error::{MmError, MmResult};
use crate::mm::lock::IrqLock;
use crate::mm::physmap::{align_up, phys_to_ptr, PAGE_SIZE};
use crate::mm::pmm;
use crate::mm::traits::SlabBackend;

const SLAB_MAGIC: u32 = 0x51AB_0001;
const OBJ_ALLOC_MAGIC: u64 = 0xA110_C000_0BADC0DE;
const OBJ_FREE_MAGIC: u64 = 0xF4EE_0BEC_5A1AB000;
const TAIL_MAGIC: u64 = 0xDEAD_10CC_FEED_FACE;
const NONE_ADDR: u64 = u64::MAX;
const MAX_CACHES: usize = 32;
const HEAD_SIZE: u64 = 8;
const TAIL_SIZE: u64 = 8;

pub type CacheId = usize;

#[repr(C)]
struct SlabHeader {
    magic: u32,
    cache_id: u32,
    in_use: u32,
    capacity: u32,
    freelist_head: u64,
    prev_phys: u64,
    next_phys: u64,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct CacheStats {
    pub allocs: u64,
    pub frees: u64,
    pub slabs_created: u64,
    pub slabs_destroyed: u64,
}

#[derive(Clone, Copy)]
struct Cache {
    name: &'static str,
    user_size: u64,
    slot_size: u64,
    align: u64,
    header_size: u64,
    capacity_per_slab: u32,
    empty: Option<u64>,
    partial: Option<u64>,
    full: Option<u64>,
    stats: CacheStats,
}

enum SlabList {
    Empty,
    Partial,
    Full,
}

impl Cache {
    fn list_head(&self, list: &SlabList) -> Option<u64> {
        match list {
            SlabList::Empty => self.empty,
            SlabList::Partial => self.partial,
            SlabList::Full => self.full,
        }
    }

    fn set_list_head(&mut self, list: &SlabList, head: Option<u64>) {
        match list {
            SlabList::Empty => self.empty = head,
            SlabList::Partial => self.partial = head,
            SlabList::Full => self.full = head,
        }
    }

    fn object_offset(&self, slot_index: u32) -> u64 {
        self.header_size + (slot_index as u64) * self.slot_size
    }
}

fn read_header(phys: u64) -> SlabHeader {
    unsafe { core::ptr::read(phys_to_ptr::<SlabHeader>(phys)) }
}

fn write_header(phys: u64, header: &SlabHeader) {
    unsafe {
        core::ptr::write(
            phys_to_ptr::<SlabHeader>(phys),
            SlabHeader {
                magic: header.magic,
                cache_id: header.cache_id,
                in_use: header.in_use,
                capacity: header.capacity,
                freelist_head: header.freelist_head,
                prev_phys: header.prev_phys,
                next_phys: header.next_phys,
            },
        )
    }
}

fn unlink(cache: &mut Cache, list: SlabList, slab_phys: u64) {
    let header = read_header(slab_phys);
    let prev = if header.prev_phys == NONE_ADDR { None } else { Some(header.prev_phys) };
    let next = if header.next_phys == NONE_ADDR { None } else { Some(header.next_phys) };

    match prev {
        Some(p) => {
            let mut ph = read_header(p);
            ph.next_phys = next.unwrap_or(NONE_ADDR);
            write_header(p, &ph);
        }
        None => cache.set_list_head(&list, next),
    }
    if let Some(n) = next {
        let mut nh = read_header(n);
        nh.prev_phys = prev.unwrap_or(NONE_ADDR);
        write_header(n, &nh);
    }
}

fn push_front(cache: &mut Cache, list: SlabList, slab_phys: u64) {
    let old_head = cache.list_head(&list);
    let mut header = read_header(slab_phys);
    header.prev_phys = NONE_ADDR;
    header.next_phys = old_head.unwrap_or(NONE_ADDR);
    write_header(slab_phys, &header);
    if let Some(h) = old_head {
        let mut hh = read_header(h);
        hh.prev_phys = slab_phys;
        write_header(h, &hh);
    }
    cache.set_list_head(&list, Some(slab_phys));
}

fn move_slab(cache: &mut Cache, from: SlabList, to: SlabList, slab_phys: u64) {
    unlink(cache, from, slab_phys);
    push_front(cache, to, slab_phys);
}

fn create_slab(cache: &mut Cache) -> MmResult<u64> {
    let slab_phys = pmm::alloc_page()?;
    let mut freelist_head = NONE_ADDR;
    let mut index = cache.capacity_per_slab;
    while index > 0 {
        index -= 1;
        let slot_phys = slab_phys + cache.object_offset(index);
        let obj_phys = slot_phys + HEAD_SIZE;
        unsafe {
            core::ptr::write(phys_to_ptr::<u64>(slot_phys), OBJ_FREE_MAGIC);
            core::ptr::write(phys_to_ptr::<u64>(obj_phys), freelist_head);
        }
        freelist_head = obj_phys;
    }

    let header = SlabHeader {
        magic: SLAB_MAGIC,
        cache_id: 0,
        in_use: 0,
        capacity: cache.capacity_per_slab,
        freelist_head,
        prev_phys: NONE_ADDR,
        next_phys: NONE_ADDR,
    };
    write_header(slab_phys, &header);
    cache.stats.slabs_created += 1;
    Ok(slab_phys)
}

fn do_alloc(cache_id: CacheId, cache: &mut Cache) -> MmResult<*mut u8> {
    let slab_phys = if let Some(p) = cache.partial {
        p
    } else if let Some(p) = cache.empty {
        unlink(cache, SlabList::Empty, p);
        push_front(cache, SlabList::Partial, p);
        p
    } else {
        let p = create_slab(cache)?;
        let mut header = read_header(p);
        header.cache_id = cache_id as u32;
        write_header(p, &header);
        push_front(cache, SlabList::Partial, p);
        p
    };

    let mut header = read_header(slab_phys);
    if header.freelist_head == NONE_ADDR {
        return Err(MmError::Corruption);
    }
    let obj_phys = header.freelist_head;
    let next = unsafe { core::ptr::read(phys_to_ptr::<u64>(obj_phys)) };
    header.freelist_head = next;
    header.in_use += 1;

    let slot_phys = obj_phys - HEAD_SIZE;
    unsafe {
        core::ptr::write(phys_to_ptr::<u64>(slot_phys), OBJ_ALLOC_MAGIC);
        core::ptr::write_bytes(phys_to_ptr::<u8>(obj_phys), 0, cache.user_size as usize);
        core::ptr::write(
            phys_to_ptr::<u64>(obj_phys + cache.user_size),
            TAIL_MAGIC,
        );
    }

    let became_full = header.in_use == header.capacity;
    write_header(slab_phys, &header);
    if became_full {
        move_slab(cache, SlabList::Partial, SlabList::Full, slab_phys);
    }

    cache.stats.allocs += 1;
    Ok(phys_to_ptr::<u8>(obj_phys))
}

fn do_free(cache: &mut Cache, obj_phys: u64, slab_phys: u64) -> MmResult<()> {
    let slot_phys = obj_phys - HEAD_SIZE;
    let head_magic = unsafe { core::ptr::read(phys_to_ptr::<u64>(slot_phys)) };
    if head_magic != OBJ_ALLOC_MAGIC {
        return Err(MmError::Corruption);
    }
    let tail_magic = unsafe { core::ptr::read(phys_to_ptr::<u64>(obj_phys + cache.user_size)) };
    if tail_magic != TAIL_MAGIC {
        return Err(MmError::Corruption);
    }

    let mut header = read_header(slab_phys);
    let was_full = header.in_use == header.capacity;

    unsafe {
        core::ptr::write(phys_to_ptr::<u64>(slot_phys), OBJ_FREE_MAGIC);
        core::ptr::write(phys_to_ptr::<u64>(obj_phys), header.freelist_head);
    }
    header.freelist_head = obj_phys;
    header.in_use -= 1;
    let now_empty = header.in_use == 0;
    write_header(slab_phys, &header);

    if was_full {
        move_slab(cache, SlabList::Full, SlabList::Partial, slab_phys);
    }
    if now_empty {
        if cache.empty.is_some() {
            unlink(cache, SlabList::Partial, slab_phys);
            pmm::free_page(slab_phys);
            cache.stats.slabs_destroyed += 1;
        } else {
            move_slab(cache, SlabList::Partial, SlabList::Empty, slab_phys);
        }
    }

    cache.stats.frees += 1;
    Ok(())
}

struct CacheTable {
    slots: [Option<Cache>; MAX_CACHES],
}

static TABLE: IrqLock<Option<CacheTable>> = IrqLock::new(None);

pub fn init() -> MmResult<()> {
    let mut guard = TABLE.lock();
    if guard.is_some() {
        return Err(MmError::AlreadyInit);
    }
    *guard = Some(CacheTable {
        slots: [None; MAX_CACHES],
    });
    Ok(())
}

pub fn cache_create(name: &'static str, user_size: usize, align: usize) -> MmResult<CacheId> {
    if user_size == 0 || align == 0 || !align.is_power_of_two() {
        return Err(MmError::Invalid);
    }

    let mut guard = TABLE.lock();
    let table = guard.as_mut().ok_or(MmError::NotInit)?;
    let slot = table.slots.iter().position(|c| c.is_none()).ok_or(MmError::CacheFull)?;

    let effective_align = (align as u64).max(8);
    let user_size = user_size as u64;
    let raw = HEAD_SIZE + user_size.max(8) + TAIL_SIZE;
    let slot_size = align_up(raw, effective_align);
    let header_size = align_up(core::mem::size_of::<SlabHeader>() as u64, effective_align);
    if header_size + slot_size > PAGE_SIZE {
        return Err(MmError::BadSize);
    }
    let capacity_per_slab = ((PAGE_SIZE - header_size) / slot_size) as u32;
    if capacity_per_slab == 0 {
        return Err(MmError::BadSize);
    }

    table.slots[slot] = Some(Cache {
        name,
        user_size,
        slot_size,
        align: effective_align,
        header_size,
        capacity_per_slab,
        empty: None,
        partial: None,
        full: None,
        stats: CacheStats::default(),
    });
    Ok(slot)
}

pub fn cache_destroy(id: CacheId) -> MmResult<()> {
    let mut guard = TABLE.lock();
    let table = guard.as_mut().ok_or(MmError::NotInit)?;
    let cache = table.slots.get_mut(id).and_then(|c| c.as_mut()).ok_or(MmError::NotFound)?;
    if cache.partial.is_some() || cache.full.is_some() {
        return Err(MmError::Invalid);
    }

    let mut cursor = cache.empty;
    while let Some(phys) = cursor {
        let header = read_header(phys);
        cursor = if header.next_phys == NONE_ADDR { None } else { Some(header.next_phys) };
        pmm::free_page(phys);
        cache.stats.slabs_destroyed += 1;
    }

    table.slots[id] = None;
    Ok(())
}

pub fn cache_find(name: &str) -> Option<CacheId> {
    let guard = TABLE.lock();
    let table = guard.as_ref()?;
    table.slots.iter().position(|c| matches!(c, Some(cache) if cache.name == name))
}

pub fn cache_stats(id: CacheId) -> MmResult<CacheStats> {
    let guard = TABLE.lock();
    let table = guard.as_ref().ok_or(MmError::NotInit)?;
    table.slots.get(id).and_then(|c| c.as_ref()).map(|c| c.stats).ok_or(MmError::NotFound)
}

pub fn alloc(id: CacheId) -> MmResult<*mut u8> {
    let mut guard = TABLE.lock();
    let table = guard.as_mut().ok_or(MmError::NotInit)?;
    let cache = table.slots.get_mut(id).and_then(|c| c.as_mut()).ok_or(MmError::NotFound)?;
    do_alloc(id, cache)
}

/// # Safety
/// `ptr` must have come from [`alloc`] on this same cache and not
/// already have been freed.
pub unsafe fn free(id: CacheId, ptr: *mut u8) -> MmResult<()> {
    let mut guard = TABLE.lock();
    let table = guard.as_mut().ok_or(MmError::NotInit)?;
    let cache = table.slots.get_mut(id).and_then(|c| c.as_mut()).ok_or(MmError::NotFound)?;

    let obj_phys = crate::mm::physmap::virt_to_phys(ptr as u64);
    let slab_phys = crate::mm::physmap::align_down(obj_phys, PAGE_SIZE);
    let header = read_header(slab_phys);
    if header.magic != SLAB_MAGIC {
        return Err(MmError::Corruption);
    }
    if header.cache_id as usize != id {
        return Err(MmError::NotFound);
    }
    do_free(cache, obj_phys, slab_phys)
}

pub fn verify_integrity(id: CacheId) -> MmResult<bool> {
    let guard = TABLE.lock();
    let table = guard.as_ref().ok_or(MmError::NotInit)?;
    let cache = table.slots.get(id).and_then(|c| c.as_ref()).ok_or(MmError::NotFound)?;

    let lists = [cache.empty, cache.partial, cache.full];
    for mut cursor in lists {
        while let Some(phys) = cursor {
            let header = read_header(phys);
            if header.magic != SLAB_MAGIC {
                return Ok(false);
            }
            cursor = if header.next_phys == NONE_ADDR { None } else { Some(header.next_phys) };
        }
    }
    Ok(true)
}

const SIZE_CLASSES: [u64; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 3584];
static SIZE_CLASS_IDS: IrqLock<[Option<CacheId>; 9]> = IrqLock::new([None; 9]);

fn size_class_for(size: u64) -> MmResult<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size).ok_or(MmError::BadSize)
}

fn size_class_cache(size: u64) -> MmResult<CacheId> {
    let class = size_class_for(size)?;
    let mut guard = SIZE_CLASS_IDS.lock();
    if let Some(id) = guard[class] {
        return Ok(id);
    }
    let id = cache_create(size_class_name(class), SIZE_CLASSES[class] as usize, 8)?;
    guard[class] = Some(id);
    Ok(id)
}

fn size_class_name(class: usize) -> &'static str {
    const NAMES: [&str; 9] = [
        "kmalloc-16",
        "kmalloc-32",
        "kmalloc-64",
        "kmalloc-128",
        "kmalloc-256",
        "kmalloc-512",
        "kmalloc-1024",
        "kmalloc-2048",
        "kmalloc-3584",
    ];
    NAMES[class]
}

/// Generic allocation facility backing [`SlabBackend`]: rounds up to
/// the nearest size class and lazily creates that class's cache.
pub struct GlobalSlabBackend;

impl SlabBackend for GlobalSlabBackend {
    unsafe fn slab_alloc(&self, size: usize, align: usize) -> MmResult<*mut u8> {
        let class = size_class_cache((size as u64).max(align as u64))?;
        alloc(class)
    }

    unsafe fn slab_free(&self, ptr: *mut u8, size: usize, align: usize) {
        if let Ok(class) = size_class_cache((size as u64).max(align as u64)) {
            let _ = free(class, ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_pmm(size: u64) {
        use std::alloc::{alloc as host_alloc, Layout};
        let layout = Layout::from_size_align(size as usize, 4096).unwrap();
        let ptr = unsafe { host_alloc(layout) };
        assert!(!ptr.is_null());
        let start = ptr as u64;
        let _ = pmm::init(start, start + size, 4096);
    }

    #[test]
    fn create_alloc_free_roundtrip() {
        reset_pmm(1024 * 1024);
        init().unwrap();
        let id = cache_create("test-obj", 64, 8).unwrap();

        let a = alloc(id).unwrap();
        let b = alloc(id).unwrap();
        assert_ne!(a, b);

        unsafe {
            free(id, a).unwrap();
            free(id, b).unwrap();
        }
        assert!(verify_integrity(id).unwrap());
    }

    #[test]
    fn list_partition_invariant() {
        reset_pmm(4 * 1024 * 1024);
        init().unwrap();
        let id = cache_create("small", 32, 8).unwrap();
        let stats_before = cache_stats(id).unwrap();
        assert_eq!(stats_before.allocs, 0);

        let mut ptrs = vec![];
        for _ in 0..200 {
            ptrs.push(alloc(id).unwrap());
        }
        for p in ptrs {
            unsafe { free(id, p).unwrap() };
        }
        assert!(verify_integrity(id).unwrap());
    }

    #[test]
    fn detects_tail_corruption() {
        reset_pmm(1024 * 1024);
        init().unwrap();
        let id = cache_create("corrupt-me", 16, 8).unwrap();
        let ptr = alloc(id).unwrap();
        unsafe {
            // Scribble one byte past the caller's region into the red zone.
            core::ptr::write(ptr.add(16), 0xFFu8);
            assert_eq!(free(id, ptr), Err(MmError::Corruption));
        }
    }
}
