use crate::commons::{
    cpu_slot, mmap_fixed, munmap_fixed, CachePadded, VAddrRange, NUM_CPU_SLOTS, STACK_SIZE,
};
use crate::sync::SpinLock;
use log::debug;
use std::io;
use std::ptr;

/// Allocates fixed-size dispatch-thread stacks out of the per-lpid stack
/// cluster window handed back by the controller at registration. Like the
/// heap windows, stack addresses come from a cluster-wide layout, so two
/// nodes of one logical process never hand out overlapping stacks.
pub struct StackAllocator {
    range: VAddrRange,
    core_caches: [CachePadded<SpinLock<*mut u8>>; NUM_CPU_SLOTS],
    global: SpinLock<GlobalPool>,
}

struct GlobalPool {
    free: Vec<*mut u8>,
    num_stacks: usize,
    /// High-water mark of simultaneously live stacks, for monitoring.
    num_touched: usize,
}

unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
    /// Maps the cluster window and carves it into `STACK_SIZE` stacks.
    pub fn new(range: VAddrRange) -> io::Result<StackAllocator> {
        let base =
            mmap_fixed(range.start, range.len())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))? as u64;
        let num_stacks = (range.len() / STACK_SIZE as u64) as usize;
        let mut free = Vec::with_capacity(num_stacks);
        // Hand out low addresses first so a lightly loaded node only ever
        // touches the front of the window.
        for i in (0..num_stacks).rev() {
            free.push((base + (i * STACK_SIZE) as u64) as *mut u8);
        }
        debug!(
            "stack cluster [{:#x}, {:#x}): {} stacks of {} KiB",
            range.start,
            range.end,
            num_stacks,
            STACK_SIZE >> 10
        );
        Ok(StackAllocator {
            range,
            core_caches: array_init::array_init(|_| CachePadded(SpinLock::new(ptr::null_mut()))),
            global: SpinLock::new(GlobalPool {
                free,
                num_stacks,
                num_touched: 0,
            }),
        })
    }

    /// Returns the base of a free stack. Running out of stacks means the
    /// node accepted more concurrent dispatches than the cluster window can
    /// carry; that is a provisioning bug, not a load condition.
    pub fn get(&self) -> *mut u8 {
        let mut cached = self.core_caches[cpu_slot()].0.lock();
        if !cached.is_null() {
            let stack = *cached;
            *cached = ptr::null_mut();
            return stack;
        }
        drop(cached);

        let mut global = self.global.lock();
        let stack = match global.free.pop() {
            Some(stack) => stack,
            None => bug!("stack cluster exhausted ({} stacks)", global.num_stacks),
        };
        let live = global.num_stacks - global.free.len();
        global.num_touched = global.num_touched.max(live);
        stack
    }

    pub fn put(&self, stack: *mut u8) {
        debug_assert!((stack as u64) >= self.range.start && (stack as u64) < self.range.end);
        let mut cached = self.core_caches[cpu_slot()].0.lock();
        if cached.is_null() {
            *cached = stack;
            return;
        }
        drop(cached);
        self.global.lock().free.push(stack);
    }

    pub fn num_touched(&self) -> usize {
        self.global.lock().num_touched
    }

    pub fn range(&self) -> VAddrRange {
        self.range
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        if let Err(err) = munmap_fixed(self.range.start, self.range.len()) {
            debug!("failed to unmap stack cluster: {}", err);
        }
    }
}
