//! The kernel heap: a single-region next-fit allocator with deferred free.
//!
//! Free space is a circular singly-linked list of blocks sorted by ascending
//! address; the circular shape keeps the next-fit cursor simple. An in-use
//! block carries a header of payload size and magic word right below the
//! user pointer.
//!
//! Allocation and direct free run with task dispatch disabled but interrupts
//! enabled; the free-list mutation itself happens under CPU Lock.
//! [`queue_free`] is the interrupt-safe variant: it pushes the block onto an
//! intrusive LIFO under a brief CPU Lock, and the idle task later drains
//! that stack with the plain [`free`].
use core::ptr::NonNull;

use crate::{
    cfg,
    error::{AllocError, BadContextError, FreeError},
    hooks, klock,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    state, task,
    utils::{Init, RawCell},
    Fatal, PortThreading,
};

/// Magic word stored in every in-use block header.
const MAGIC: u32 = 0x6D6D_4F1C;

/// Header of an in-use block. The user pointer is the byte past it.
#[repr(C)]
#[derive(Clone, Copy)]
struct UsedHeader {
    size: u32,
    magic: u32,
}

/// Header of a free block, stored in the block itself.
#[repr(C)]
#[derive(Clone, Copy)]
struct FreeBlock {
    size: usize,
    /// Address of the next free block. The list is circular, so this is
    /// never 0 while the block is linked.
    next: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<UsedHeader>();
const MIN_BLOCK: usize = core::mem::size_of::<FreeBlock>();
const ALIGN: usize = core::mem::align_of::<FreeBlock>();

#[repr(align(16))]
struct HeapRegion([u8; cfg::HEAP_SIZE]);

impl Init for HeapRegion {
    const INIT: Self = Self([0; cfg::HEAP_SIZE]);
}

/// Read the free-block header at `addr`.
///
/// # Safety
///
/// `addr` must hold a live free-block header inside the heap region.
unsafe fn blk(addr: usize) -> FreeBlock {
    unsafe { core::ptr::read(addr as *const FreeBlock) }
}

/// Overwrite the free-block header at `addr`.
///
/// # Safety
///
/// `addr .. addr + MIN_BLOCK` must be dead memory inside the heap region.
unsafe fn set_blk(addr: usize, size: usize, next: usize) {
    unsafe { core::ptr::write(addr as *mut FreeBlock, FreeBlock { size, next }) };
}

/// Update only the link of the free-block header at `addr`.
///
/// # Safety
///
/// Same as [`blk`].
unsafe fn set_next(addr: usize, next: usize) {
    unsafe { (*(addr as *mut FreeBlock)).next = next };
}

/// Update only the size of the free-block header at `addr`.
///
/// # Safety
///
/// Same as [`blk`].
unsafe fn set_size(addr: usize, size: usize) {
    unsafe { (*(addr as *mut FreeBlock)).size = size };
}

/// Snapshot of allocator statistics returned by [`status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatus {
    /// Bytes currently free (headers of future allocations included).
    pub remain: usize,
    /// Highest heap usage ever observed, in bytes.
    pub peak_usage: usize,
    /// Number of blocks on the free list.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
    pub alloc_count: u32,
    pub free_count: u32,
}

pub(crate) struct Heap<Traits> {
    region: RawCell<HeapRegion>,
    /// Region start address, fixed at init.
    base: CpuLockCell<Traits, usize>,
    /// Next-fit cursor: the block the last allocation stopped at, or 0 when
    /// the heap is exhausted.
    iter: CpuLockCell<Traits, usize>,
    /// Highest-addressed free block, or 0 when the heap is exhausted.
    end: CpuLockCell<Traits, usize>,
    remain: CpuLockCell<Traits, usize>,
    min_remain: CpuLockCell<Traits, usize>,
    alloc_count: CpuLockCell<Traits, u32>,
    free_count: CpuLockCell<Traits, u32>,
    /// Head of the deferred-free LIFO (0 = empty). Links ride in the first
    /// payload word of each queued block.
    pending: CpuLockCell<Traits, usize>,
}

impl<Traits> Init for Heap<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        region: Init::INIT,
        base: Init::INIT,
        iter: Init::INIT,
        end: Init::INIT,
        remain: Init::INIT,
        min_remain: Init::INIT,
        alloc_count: Init::INIT,
        free_count: Init::INIT,
        pending: Init::INIT,
    };
}

impl<Traits: PortThreading> Heap<Traits> {
    /// Reset the heap to one spanning free block.
    pub(crate) fn init(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let base = self.region.get() as usize;
        debug_assert_eq!(base % ALIGN, 0);

        // Safety: the whole region is ours to overwrite
        unsafe { set_blk(base, cfg::HEAP_SIZE, base) };

        self.base.replace(&mut *lock, base);
        self.iter.replace(&mut *lock, base);
        self.end.replace(&mut *lock, base);
        self.remain.replace(&mut *lock, cfg::HEAP_SIZE);
        self.min_remain.replace(&mut *lock, cfg::HEAP_SIZE);
        self.alloc_count.replace(&mut *lock, 0);
        self.free_count.replace(&mut *lock, 0);
        self.pending.replace(&mut *lock, 0);
    }

    pub(crate) fn contains(&self, lock: CpuLockTokenRefMut<'_, Traits>, addr: usize) -> bool {
        let base = self.base.get(&*lock);
        addr >= base && addr < base + cfg::HEAP_SIZE
    }
}

/// Allocate `size` bytes from the kernel heap.
///
/// Runs with task dispatch disabled. Callable from task context only; must
/// not be called with CPU Lock already held.
pub fn allocate<Traits: PortThreading>(size: usize) -> Result<NonNull<u8>, AllocError> {
    task::disable_task_switch::<Traits>();
    let result = allocate_inner::<Traits>(size);
    task::enable_task_switch::<Traits>();
    result
}

fn allocate_inner<Traits: PortThreading>(size: usize) -> Result<NonNull<u8>, AllocError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_task_context::<Traits>()?;
    let heap = &Traits::state().heap;

    let fail = |mut lock: klock::CpuLockGuard<Traits>| {
        hooks::fire(lock.borrow_mut(), &Traits::state().hooks.alloc_failed, size);
        Err(AllocError::OutOfMemory)
    };

    // round up to the alignment grain, never below a linkable block
    let rounded = size.max(MIN_BLOCK);
    let rounded = (rounded + ALIGN - 1) & !(ALIGN - 1);
    let rq = rounded + HEADER_SIZE;

    let end = heap.end.get(&*lock);
    if size == 0 || rounded > u32::MAX as usize || rq > heap.remain.get(&*lock) || end == 0 {
        return fail(lock);
    }

    let mut iter = heap.iter.get(&*lock);

    // Safety note: `iter` and `end` address live free blocks whenever they
    // are non-zero; every path below maintains that invariant.
    let only_one_free_block = unsafe { blk(end) }.next == end;

    if !only_one_free_block {
        // resume the search after the block the last allocation stopped at
        iter = unsafe { blk(iter) }.next;
        let origin = iter;
        loop {
            let candidate = unsafe { blk(iter) }.next;
            if unsafe { blk(candidate) }.size >= rq {
                break;
            }
            iter = candidate;

            // walked the whole ring without a fit
            if iter == origin {
                return fail(lock);
            }
        }
    }

    let new_block = unsafe { blk(iter) }.next;
    let block_size = unsafe { blk(new_block) }.size;
    if block_size < rq {
        return fail(lock);
    }

    let consumed;
    let mut splitted = 0usize;
    if block_size - rq >= MIN_BLOCK {
        // enough room to split off a trailing remainder
        consumed = rq;
        splitted = new_block + rq;

        if only_one_free_block {
            // Safety: the remainder region is dead
            unsafe { set_blk(splitted, block_size - rq, splitted) };
            iter = splitted;
        } else {
            unsafe {
                set_blk(splitted, block_size - rq, blk(new_block).next);
                set_next(iter, splitted);
            }
        }
    } else {
        // the block is consumed whole, trailing slack included
        consumed = block_size;
        if only_one_free_block {
            // that was the last free block: the heap is now full
            iter = 0;
        } else {
            unsafe { set_next(iter, blk(new_block).next) };
        }
    }

    if new_block == end {
        let new_end = if splitted != 0 { splitted } else { iter };
        heap.end.replace(&mut *lock, new_end);
    }
    heap.iter.replace(&mut *lock, iter);

    // Safety: `new_block` is detached from the free list and owned here
    unsafe {
        let header = new_block as *mut UsedHeader;
        (*header).size = (consumed - HEADER_SIZE) as u32;
        (*header).magic = MAGIC;
    }

    let remain = heap.remain.get(&*lock) - consumed;
    heap.remain.replace(&mut *lock, remain);
    heap.alloc_count
        .replace_with(&mut *lock, |c| c.wrapping_add(1));
    if remain < heap.min_remain.get(&*lock) {
        heap.min_remain.replace(&mut *lock, remain);
    }

    Ok(NonNull::new((new_block + HEADER_SIZE) as *mut u8).unwrap())
}

/// Return a block to the heap, coalescing with its address neighbors.
///
/// A corrupted block header (double free, stray write, or an address that
/// never came from [`allocate`]) is fatal.
pub fn free<Traits: PortThreading>(ptr: NonNull<u8>) -> Result<(), FreeError> {
    task::disable_task_switch::<Traits>();
    let result = free_inner::<Traits>(ptr);
    task::enable_task_switch::<Traits>();
    result
}

fn free_inner<Traits: PortThreading>(ptr: NonNull<u8>) -> Result<(), FreeError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_task_context::<Traits>()?;
    let heap = &Traits::state().heap;
    let addr = ptr.as_ptr() as usize;

    if !heap.contains(lock.borrow_mut(), addr) {
        hooks::fire(lock.borrow_mut(), &Traits::state().hooks.free_failed, addr);
        return Err(FreeError::NotOnHeap);
    }

    let rls = addr - HEADER_SIZE;
    // Safety: `rls` is inside the heap region
    let header = unsafe { core::ptr::read(rls as *const UsedHeader) };
    if header.magic != MAGIC {
        hooks::fire(lock.borrow_mut(), &Traits::state().hooks.free_failed, addr);
        Traits::trap(Fatal::HeapCorruption);
    }
    let rls_size = header.size as usize + HEADER_SIZE;

    heap.free_count
        .replace_with(&mut *lock, |c| c.wrapping_add(1));
    heap.remain.replace_with(&mut *lock, |r| *r + rls_size);

    let end = heap.end.get(&*lock);
    if end == 0 {
        // the heap was fully allocated; this block re-establishes the list
        unsafe { set_blk(rls, rls_size, rls) };
        heap.iter.replace(&mut *lock, rls);
        heap.end.replace(&mut *lock, rls);
        return Ok(());
    }

    // find the address-order neighbors; `end.next` is the lowest block
    let mut left = end;
    if rls < left {
        while unsafe { blk(left) }.next < rls {
            left = unsafe { blk(left) }.next;
        }
    }
    let right = unsafe { blk(left) }.next;

    unsafe {
        set_next(left, rls);
        set_blk(rls, rls_size, right);
    }
    let mut merge_block = rls;

    let left_hdr = unsafe { blk(left) };
    if left + left_hdr.size == rls {
        merge_block = left;
        unsafe {
            set_size(left, left_hdr.size + rls_size);
            set_next(left, right);
        }
    }

    if rls + rls_size == right {
        let right_hdr = unsafe { blk(right) };
        unsafe {
            set_size(merge_block, blk(merge_block).size + right_hdr.size);
            set_next(merge_block, right_hdr.next);
        }

        if heap.iter.get(&*lock) == right {
            heap.iter.replace(&mut *lock, merge_block);
        }
        if heap.end.get(&*lock) == right {
            heap.end.replace(&mut *lock, merge_block);
        }
    }

    if heap.end.get(&*lock) < rls {
        heap.end.replace(&mut *lock, merge_block);
    }

    Ok(())
}

/// Queue a block for deferred release. Callable from interrupt context; the
/// idle task performs the actual [`free`] later.
pub fn queue_free<Traits: PortThreading>(ptr: NonNull<u8>) -> Result<(), FreeError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    queue_free_with_lock::<Traits>(lock.borrow_mut(), ptr)
}

pub(crate) fn queue_free_with_lock<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    ptr: NonNull<u8>,
) -> Result<(), FreeError> {
    let heap = &Traits::state().heap;
    let addr = ptr.as_ptr() as usize;

    if !heap.contains(lock.borrow_mut(), addr) {
        hooks::fire(lock.borrow_mut(), &Traits::state().hooks.free_failed, addr);
        return Err(FreeError::NotOnHeap);
    }

    // the link rides in the first payload word; the block header stays
    // intact for the eventual `free`
    let head = heap.pending.get(&*lock);
    // Safety: the payload is at least `MIN_BLOCK` bytes and dead
    unsafe { *(addr as *mut usize) = head };
    heap.pending.replace(&mut *lock, addr);
    Ok(())
}

/// Release every block queued by [`queue_free`]. Called by the idle task.
pub(crate) fn drain_deferred<Traits: PortThreading>() -> Result<(), BadContextError> {
    loop {
        let addr = {
            let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
            let heap = &Traits::state().heap;
            let head = heap.pending.get(&*lock);
            if head == 0 {
                return Ok(());
            }
            // Safety: `head` was queued by `queue_free_with_lock`
            let next = unsafe { *(head as *const usize) };
            heap.pending.replace(&mut *lock, next);
            head
        };

        let _ = free::<Traits>(NonNull::new(addr as *mut u8).unwrap());
    }
}

/// Bytes currently free.
pub fn remain_size<Traits: PortThreading>() -> Result<usize, BadContextError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    Ok(Traits::state().heap.remain.get(&*lock))
}

/// Walk the free list and report allocator statistics.
pub fn status<Traits: PortThreading>() -> Result<HeapStatus, BadContextError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let heap = &Traits::state().heap;

    let mut free_blocks = 0;
    let mut largest_free = 0;
    let end = heap.end.get(&*lock);
    if end != 0 {
        free_blocks = 1;
        // Safety: `end` addresses a live free block
        largest_free = unsafe { blk(end) }.size;
        let mut cursor = unsafe { blk(end) }.next;
        while cursor != end {
            free_blocks += 1;
            let size = unsafe { blk(cursor) }.size;
            if size > largest_free {
                largest_free = size;
            }
            cursor = unsafe { blk(cursor) }.next;
        }
    }

    Ok(HeapStatus {
        remain: heap.remain.get(&*lock),
        peak_usage: cfg::HEAP_SIZE - heap.min_remain.get(&*lock),
        free_blocks,
        largest_free,
        alloc_count: heap.alloc_count.get(&*lock),
        free_count: heap.free_count.get(&*lock),
    })
}

/// Whether `addr` lies inside the kernel heap region.
pub fn is_heap_addr<Traits: PortThreading>(addr: usize) -> Result<bool, BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    Ok(Traits::state().heap.contains(lock.borrow_mut(), addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{with_state_unlocked, StubPort};
    use std::vec::Vec;

    fn check_free_list_invariants() {
        let lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
        let heap = &StubPort::state().heap;
        let end = heap.end.get(&*lock);
        if end == 0 {
            assert_eq!(heap.iter.get(&*lock), 0);
            return;
        }

        // walking from `end.next` (the lowest block) visits strictly
        // ascending, non-adjacent blocks, and their sizes sum to `remain`
        let lowest = unsafe { blk(end) }.next;
        let mut sum = 0usize;
        let mut cursor = lowest;
        let mut prev: Option<(usize, usize)> = None;
        loop {
            let size = unsafe { blk(cursor) }.size;
            sum += size;
            if let Some((paddr, psize)) = prev {
                assert!(paddr + psize < cursor, "adjacent free blocks left unmerged");
            }
            prev = Some((cursor, size));
            let next = unsafe { blk(cursor) }.next;
            if next == lowest {
                break;
            }
            assert!(next > cursor, "free list not in ascending address order");
            cursor = next;
        }
        assert_eq!(cursor, end, "`end` is not the highest-addressed block");
        assert_eq!(sum, heap.remain.get(&*lock));

        // the next-fit cursor must rest on a live block
        let iter = heap.iter.get(&*lock);
        let mut found = iter == end;
        let mut c = lowest;
        while c != end {
            if c == iter {
                found = true;
            }
            c = unsafe { blk(c) }.next;
        }
        assert!(found, "next-fit cursor points outside the free list");
    }

    #[test]
    fn alloc_free_restores_remain_size() {
        with_state_unlocked(|| {
            let before = remain_size::<StubPort>().unwrap();
            let p = allocate::<StubPort>(100).unwrap();
            assert!(remain_size::<StubPort>().unwrap() < before);
            free::<StubPort>(p).unwrap();
            assert_eq!(remain_size::<StubPort>().unwrap(), before);
            check_free_list_invariants();
        });
    }

    #[test]
    fn coalescing_merges_neighbors() {
        with_state_unlocked(|| {
            let a = allocate::<StubPort>(64).unwrap();
            let b = allocate::<StubPort>(64).unwrap();
            let c = allocate::<StubPort>(64).unwrap();

            // free out of order; every release must merge back
            free::<StubPort>(b).unwrap();
            check_free_list_invariants();
            free::<StubPort>(a).unwrap();
            check_free_list_invariants();
            free::<StubPort>(c).unwrap();
            check_free_list_invariants();

            let st = status::<StubPort>().unwrap();
            assert_eq!(st.free_blocks, 1);
            assert_eq!(st.remain, crate::cfg::HEAP_SIZE);
        });
    }

    #[test]
    fn exhaustion_then_free_reestablishes_cursor() {
        with_state_unlocked(|| {
            let mut held = Vec::new();
            loop {
                match allocate::<StubPort>(4096) {
                    Ok(p) => held.push(p),
                    Err(AllocError::OutOfMemory) => break,
                    Err(e) => panic!("{e:?}"),
                }
            }
            assert!(!held.is_empty());

            // grab whatever small blocks are left so the heap really drains
            while let Ok(p) = allocate::<StubPort>(1) {
                held.push(p);
            }

            let p = held.pop().unwrap();
            free::<StubPort>(p).unwrap();
            check_free_list_invariants();
            let st = status::<StubPort>().unwrap();
            assert!(st.free_blocks >= 1);
            assert!(allocate::<StubPort>(8).is_ok());

            for p in held {
                free::<StubPort>(p).unwrap();
            }
            check_free_list_invariants();
        });
    }

    #[test]
    fn deferred_free_is_reclaimed_by_drain() {
        with_state_unlocked(|| {
            let before = remain_size::<StubPort>().unwrap();
            let p = allocate::<StubPort>(200).unwrap();

            queue_free::<StubPort>(p).unwrap();
            // not reclaimed until the idle task runs
            assert!(remain_size::<StubPort>().unwrap() < before);

            drain_deferred::<StubPort>().unwrap();
            assert_eq!(remain_size::<StubPort>().unwrap(), before);
            check_free_list_invariants();
        });
    }

    #[test]
    fn free_of_foreign_address_is_rejected() {
        with_state_unlocked(|| {
            let mut local = 0u64;
            let p = NonNull::new(&mut local as *mut u64 as *mut u8).unwrap();
            assert_eq!(free::<StubPort>(p), Err(FreeError::NotOnHeap));
            assert_eq!(queue_free::<StubPort>(p), Err(FreeError::NotOnHeap));
        });
    }

    #[test]
    fn random_alloc_free_keeps_invariants() {
        with_state_unlocked(|| {
            let mut held: Vec<(NonNull<u8>, usize)> = Vec::new();
            let mut seed = 0x2F6E_2B1Eu32;
            let mut rand = move || {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                seed
            };

            for _ in 0..400 {
                if rand() % 3 != 0 {
                    let size = (rand() % 700 + 1) as usize;
                    if let Ok(p) = allocate::<StubPort>(size) {
                        // scribble over the payload; headers must survive
                        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xA5, size) };
                        held.push((p, size));
                    }
                } else if !held.is_empty() {
                    let at = rand() as usize % held.len();
                    let (p, _) = held.swap_remove(at);
                    free::<StubPort>(p).unwrap();
                }
                check_free_list_invariants();
            }

            for (p, _) in held {
                free::<StubPort>(p).unwrap();
            }
            let st = status::<StubPort>().unwrap();
            assert_eq!(st.remain, crate::cfg::HEAP_SIZE);
            assert_eq!(st.free_blocks, 1);
        });
    }
}
