use crate::commons::{cpu_slot, CachePadded, NUM_CPU_SLOTS};
use crate::sync::SpinLock;
use std::ptr;

/// Size classes are powers of two from 32 B up to 32 GiB. An arena never
/// actually holds the top classes; allocations that exceed the remaining
/// arena simply fail.
pub const MIN_SLAB_CLASS_SHIFT: u32 = 5;
pub const MAX_SLAB_CLASS_SHIFT: u32 = 35;
const NUM_CLASSES: usize = (MAX_SLAB_CLASS_SHIFT + 1) as usize;

/// Every block starts with a 16-byte prefix: 8 bytes of padding keeping the
/// payload 16-aligned, then the header directly in front of the payload.
pub const BLOCK_PREFIX: usize = 16;
const PTR_HEADER_SIZE: usize = 8;

/// Per-core caches shrink as the object size grows; the smallest classes get
/// the deepest caches.
const MAX_CACHE_SIZE: u32 = 32;
const CACHE_SIZE_CUTOFF: u32 = 64 << 10;

fn cache_size(size: u64) -> u32 {
    let capped = size.min(u64::from(CACHE_SIZE_CUTOFF)) as u32;
    let decay = capped / (CACHE_SIZE_CUTOFF / MAX_CACHE_SIZE);
    (MAX_CACHE_SIZE.saturating_sub(decay)).max(1)
}

fn class_shift(size: u64) -> u32 {
    let size = size.max(1);
    let shift = 64 - (size - 1).leading_zeros();
    shift.max(MIN_SLAB_CLASS_SHIFT)
}

fn block_size(shift: u32) -> u64 {
    (1u64 << shift) + BLOCK_PREFIX as u64
}

/// 8-byte header preceding every returned payload; `free` cross-checks the
/// sentinel and routes on the recorded size.
#[repr(C)]
#[derive(Copy, Clone)]
struct PtrHeader {
    word: u64,
}

impl PtrHeader {
    fn new(size: u64, sentinel: u16) -> PtrHeader {
        debug_assert!(size < (1 << 48));
        PtrHeader {
            word: size | (u64::from(sentinel) << 48),
        }
    }

    fn size(self) -> u64 {
        self.word & ((1 << 48) - 1)
    }

    fn sentinel(self) -> u16 {
        (self.word >> 48) as u16
    }
}

struct CoreCache {
    heads: [*mut u8; NUM_CLASSES],
    cnts: [u32; NUM_CLASSES],
}

impl Default for CoreCache {
    fn default() -> CoreCache {
        CoreCache {
            heads: [ptr::null_mut(); NUM_CLASSES],
            cnts: [0; NUM_CLASSES],
        }
    }
}

struct GlobalArena {
    cur: *mut u8,
    end: *mut u8,
    heads: [*mut u8; NUM_CLASSES],
}

// Free blocks form intrusive singly-linked lists through their first word.
unsafe fn pop(head: &mut *mut u8) -> *mut u8 {
    let old = *head;
    *head = *(old as *mut *mut u8);
    old
}

unsafe fn push(head: &mut *mut u8, block: *mut u8) {
    *(block as *mut *mut u8) = *head;
    *head = block;
}

/// Bump-pointer slab partitioned into power-of-two size classes with
/// per-core free caches. Backs both the runtime heap and each proclet heap.
pub struct SlabAllocator {
    id: u16,
    start: *mut u8,
    global: SpinLock<GlobalArena>,
    core_caches: [CachePadded<SpinLock<CoreCache>>; NUM_CPU_SLOTS],
}

unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

impl SlabAllocator {
    /// `buf` must stay mapped for the lifetime of the allocator and must be
    /// 16-byte aligned.
    pub unsafe fn new(id: u16, buf: *mut u8, len: usize) -> SlabAllocator {
        debug_assert_eq!(buf as usize % BLOCK_PREFIX, 0);
        SlabAllocator {
            id,
            start: buf,
            global: SpinLock::new(GlobalArena {
                cur: buf,
                end: buf.add(len),
                heads: [ptr::null_mut(); NUM_CLASSES],
            }),
            core_caches: array_init::array_init(|_| {
                CachePadded(SpinLock::new(CoreCache::default()))
            }),
        }
    }

    pub fn slab_id(&self) -> u16 {
        self.id
    }

    pub fn base(&self) -> *mut u8 {
        self.start
    }

    /// Bytes of the arena consumed by the bump pointer. Freed blocks stay
    /// counted; they are recycled, not returned.
    pub fn usage(&self) -> u64 {
        let global = self.global.lock();
        global.cur as u64 - self.start as u64
    }

    pub fn remaining(&self) -> u64 {
        let global = self.global.lock();
        global.end as u64 - global.cur as u64
    }

    /// Returns a payload pointer aligned to 16 bytes, or null once the
    /// arena is exhausted for this class. Never blocks beyond its spinlocks.
    pub fn allocate(&self, size: u64) -> *mut u8 {
        let shift = class_shift(size);
        if shift > MAX_SLAB_CLASS_SHIFT {
            return ptr::null_mut();
        }
        let class = shift as usize;

        let mut cache = self.core_caches[cpu_slot()].0.lock();
        if cache.cnts[class] == 0 {
            self.refill(&mut cache, shift);
        }
        if cache.cnts[class] == 0 {
            return ptr::null_mut();
        }
        let block = unsafe { pop(&mut cache.heads[class]) };
        cache.cnts[class] -= 1;
        drop(cache);

        unsafe {
            let payload = block.add(BLOCK_PREFIX);
            let hdr = payload.sub(PTR_HEADER_SIZE) as *mut PtrHeader;
            hdr.write(PtrHeader::new(size, self.id));
            payload
        }
    }

    /// Moves up to a cache's worth of blocks from the global free list and
    /// then from the bump arena into the calling core's cache.
    fn refill(&self, cache: &mut CoreCache, shift: u32) {
        let class = shift as usize;
        let want = cache_size(1u64 << shift);
        let bsize = block_size(shift);
        let mut global = self.global.lock();
        while !global.heads[class].is_null() && cache.cnts[class] < want {
            unsafe {
                let block = pop(&mut global.heads[class]);
                push(&mut cache.heads[class], block);
            }
            cache.cnts[class] += 1;
        }
        while cache.cnts[class] < want {
            let cur = global.cur;
            if cur as u64 + bsize > global.end as u64 {
                break;
            }
            global.cur = unsafe { cur.add(bsize as usize) };
            unsafe { push(&mut cache.heads[class], cur) };
            cache.cnts[class] += 1;
        }
    }

    /// Must be paired with exactly one prior `allocate` from this arena;
    /// anything else trips the sentinel check and aborts.
    pub fn free(&self, payload: *mut u8) {
        let (block, shift) = unsafe {
            let hdr = (payload.sub(PTR_HEADER_SIZE) as *mut PtrHeader).read();
            bug_on!(
                hdr.sentinel() != self.id,
                "slab sentinel mismatch: {:#x} != {:#x}",
                hdr.sentinel(),
                self.id
            );
            (payload.sub(BLOCK_PREFIX), class_shift(hdr.size()))
        };
        let class = shift as usize;
        let limit = cache_size(1u64 << shift);

        let mut cache = self.core_caches[cpu_slot()].0.lock();
        unsafe { push(&mut cache.heads[class], block) };
        cache.cnts[class] += 1;
        if cache.cnts[class] > limit {
            // Spill half back to the global pool.
            let mut global = self.global.lock();
            while cache.cnts[class] > (limit / 2).max(1) {
                unsafe {
                    let block = pop(&mut cache.heads[class]);
                    push(&mut global.heads[class], block);
                }
                cache.cnts[class] -= 1;
            }
        }
    }

    /// Succeeds only if the bump pointer has not yet passed `new_len`; used
    /// by migration to trim the unused tail before transfer.
    pub fn try_shrink(&self, new_len: u64) -> bool {
        let mut global = self.global.lock();
        let new_end = self.start as u64 + new_len;
        if (global.cur as u64) > new_end {
            return false;
        }
        global.end = new_end as *mut u8;
        true
    }
}

/// Owned byte buffer carved from a slab, freed on drop. Used for request
/// payload scratch so the data path allocates from the runtime heap rather
/// than the process allocator.
pub struct SlabBuf {
    slab: &'static SlabAllocator,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for SlabBuf {}

impl SlabBuf {
    pub fn alloc(slab: &'static SlabAllocator, len: usize) -> Option<SlabBuf> {
        let ptr = slab.allocate(len.max(1) as u64);
        if ptr.is_null() {
            None
        } else {
            Some(SlabBuf { slab, ptr, len })
        }
    }
}

impl std::ops::Deref for SlabBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl std::ops::DerefMut for SlabBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for SlabBuf {
    fn drop(&mut self) {
        self.slab.free(self.ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena {
        buf: Vec<u8>,
    }

    impl Arena {
        fn new(len: usize) -> Arena {
            // Over-allocate so the 16-byte alignment requirement holds.
            Arena {
                buf: vec![0u8; len + BLOCK_PREFIX],
            }
        }

        fn slab(&mut self, id: u16) -> SlabAllocator {
            let addr = self.buf.as_mut_ptr() as usize;
            let aligned = (addr + BLOCK_PREFIX - 1) & !(BLOCK_PREFIX - 1);
            let len = self.buf.len() - (aligned - addr);
            unsafe { SlabAllocator::new(id, aligned as *mut u8, len & !(BLOCK_PREFIX - 1)) }
        }
    }

    #[test]
    fn allocate_then_free_recycles() {
        let mut arena = Arena::new(1 << 20);
        let slab = arena.slab(7);
        let p = slab.allocate(100);
        assert!(!p.is_null());
        let usage = slab.usage();
        slab.free(p);
        let q = slab.allocate(100);
        assert_eq!(p, q, "freed block of the same class is reused");
        assert_eq!(slab.usage(), usage, "bump counter unchanged by free/alloc");
        slab.free(q);
    }

    #[test]
    fn payloads_are_aligned_and_disjoint() {
        let mut arena = Arena::new(1 << 20);
        let slab = arena.slab(1);
        let mut ptrs = Vec::new();
        for i in 0..64u64 {
            let p = slab.allocate(32 + i);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            ptrs.push(p);
        }
        ptrs.sort();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 64);
    }

    #[test]
    fn exhaustion_returns_null() {
        // One 1024-byte class block fits; the second allocation must fail
        // once the per-core refill has carved everything it can.
        let mut arena = Arena::new((1024 + BLOCK_PREFIX) as usize);
        let slab = arena.slab(2);
        let p = slab.allocate(1024);
        assert!(!p.is_null());
        let q = slab.allocate(1024);
        assert!(q.is_null());
        slab.free(p);
        // Freed block is recycled even though the bump arena is spent.
        let r = slab.allocate(1000);
        assert_eq!(r, p);
    }

    #[test]
    fn try_shrink_only_behind_bump() {
        let mut arena = Arena::new(1 << 20);
        let slab = arena.slab(3);
        let _p = slab.allocate(64);
        let used = slab.usage();
        assert!(!slab.try_shrink(0));
        assert!(slab.try_shrink(used));
        // All carved classes remain usable after the shrink.
        let q = slab.allocate(64);
        assert!(!q.is_null() || slab.remaining() == 0);
    }

    #[test]
    fn class_shift_rounds_up() {
        assert_eq!(class_shift(1), MIN_SLAB_CLASS_SHIFT);
        assert_eq!(class_shift(32), 5);
        assert_eq!(class_shift(33), 6);
        assert_eq!(class_shift(4096), 12);
        assert_eq!(class_shift(4097), 13);
    }

    #[test]
    fn cache_size_decays_with_object_size() {
        assert_eq!(cache_size(32), MAX_CACHE_SIZE);
        assert!(cache_size(16 << 10) < MAX_CACHE_SIZE);
        assert_eq!(cache_size(1 << 20), 1);
    }
}
