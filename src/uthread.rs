use crate::commons::STACK_SIZE;
use crate::stack::StackAllocator;
use crate::sync::{SpinLock, Waiter, WakeStatus};
use log::debug;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-dispatch-thread record registered in the owning proclet's thread set
/// for as long as the thread executes inside the proclet. Migration uses it
/// two ways: the wait slot lets the quiescer wake parked threads with an
/// eviction status, and the registration itself is what `thread_cnt`
/// counts.
pub struct ThreadEntry {
    id: u64,
    wait: SpinLock<WaitSlot>,
}

#[derive(Default)]
struct WaitSlot {
    waiter: Option<Arc<Waiter>>,
    /// Threads parked on a mutex, condvar, or sleep may be evicted; threads
    /// parked on an outbound RPC reply may not (their nested call's side
    /// effects must never replay), so quiesce drains them instead.
    evictable: bool,
}

impl ThreadEntry {
    pub fn new() -> Arc<ThreadEntry> {
        Arc::new(ThreadEntry {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            wait: SpinLock::new(WaitSlot::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publishes `waiter` as this thread's current park target. The publish
    /// and the eviction sweep race through the same spin lock, so a sweep
    /// either sees the waiter (and wakes it) or completes before we
    /// publish; in the latter case the caller must re-check the proclet's
    /// migrating flag after publishing, before blocking (see `sync::mutex`).
    pub fn publish_wait(&self, waiter: &Arc<Waiter>, evictable: bool) {
        let mut slot = self.wait.lock();
        slot.waiter = Some(Arc::clone(waiter));
        slot.evictable = evictable;
    }

    pub fn clear_wait(&self) {
        let mut slot = self.wait.lock();
        slot.waiter = None;
        slot.evictable = false;
    }

    /// Publish-then-block convenience for parks that need no migrating-flag
    /// re-check (non-evictable waits).
    pub fn park(&self, waiter: &Arc<Waiter>, evictable: bool) -> WakeStatus {
        self.publish_wait(waiter, evictable);
        let status = waiter.wait();
        self.clear_wait();
        status
    }

    /// Called by the migrator with the proclet's migrating flag already
    /// raised. Returns true if a parked evictable waiter was woken.
    pub fn evict(&self) -> bool {
        let slot = self.wait.lock();
        match slot.waiter {
            Some(ref waiter) if slot.evictable => waiter.wake(WakeStatus::Evicted),
            _ => false,
        }
    }
}

/// An OS thread whose stack was placed in the per-lpid stack cluster with
/// `pthread_attr_setstack`, so the stack address itself comes out of the
/// cluster-wide VA layout.
pub struct UThread {
    tid: libc::pthread_t,
    stack: *mut u8,
}

unsafe impl Send for UThread {}

extern "C" fn trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    let f: Box<Box<dyn FnOnce() + Send>> = unsafe { Box::from_raw(arg as *mut _) };
    f();
    std::ptr::null_mut()
}

impl UThread {
    pub fn spawn<F>(stack: *mut u8, f: F) -> io::Result<UThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(f));
        let arg = Box::into_raw(boxed) as *mut libc::c_void;
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            let rc = libc::pthread_attr_init(&mut attr);
            if rc != 0 {
                drop(Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>));
                return Err(io::Error::from_raw_os_error(rc));
            }
            libc::pthread_attr_setstack(&mut attr, stack as *mut libc::c_void, STACK_SIZE);
            let mut tid: libc::pthread_t = mem::zeroed();
            let rc = libc::pthread_create(&mut tid, &attr, trampoline, arg);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                drop(Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>));
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(UThread { tid, stack })
        }
    }

    pub fn join(self) -> *mut u8 {
        unsafe {
            libc::pthread_join(self.tid, std::ptr::null_mut());
        }
        self.stack
    }
}

/// A thread's stack may only be reused after the kernel thread has fully
/// exited, so finished dispatch threads hand themselves to the reaper,
/// which joins them off the critical path and returns their stacks to the
/// allocator.
pub struct Reaper {
    tx: SpinLock<Option<Sender<UThread>>>,
    worker: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl Reaper {
    pub fn new(stacks: Arc<StackAllocator>) -> Reaper {
        let (tx, rx) = channel::<UThread>();
        let worker = std::thread::Builder::new()
            .name("drift-reaper".into())
            .spawn(move || {
                for uth in rx.iter() {
                    let stack = uth.join();
                    stacks.put(stack);
                }
            })
            .expect("spawn reaper");
        Reaper {
            tx: SpinLock::new(Some(tx)),
            worker: SpinLock::new(Some(worker)),
        }
    }

    pub fn retire(&self, uth: UThread) {
        let tx = self.tx.lock();
        if let Some(ref tx) = *tx {
            if tx.send(uth).is_err() {
                debug!("reaper gone; leaking one stack");
            }
        }
    }

    pub fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::{VAddrRange, MIN_STACK_CLUSTER_VADDR, STACK_CLUSTER_SIZE};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_runs_on_cluster_stack() {
        let range = VAddrRange {
            start: MIN_STACK_CLUSTER_VADDR + 210 * STACK_CLUSTER_SIZE,
            end: MIN_STACK_CLUSTER_VADDR + 211 * STACK_CLUSTER_SIZE,
        };
        let stacks = Arc::new(StackAllocator::new(range).unwrap());
        let stack = stacks.get();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let lo = stack as u64;
        let hi = lo + STACK_SIZE as u64;
        let uth = UThread::spawn(stack, move || {
            let marker = 0u8;
            let sp = &marker as *const u8 as u64;
            assert!(sp >= lo && sp < hi, "stack pointer outside cluster stack");
            ran2.store(1, Ordering::SeqCst);
        })
        .unwrap();
        let returned = uth.join();
        assert_eq!(returned, stack);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        stacks.put(stack);
    }

    #[test]
    fn evict_only_wakes_evictable_parks() {
        let entry = ThreadEntry::new();
        assert!(!entry.evict(), "no waiter registered");

        let waiter = Arc::new(Waiter::new());
        {
            let mut slot = entry.wait.lock();
            slot.waiter = Some(Arc::clone(&waiter));
            slot.evictable = false;
        }
        assert!(!entry.evict(), "non-evictable park must be left alone");
        {
            let mut slot = entry.wait.lock();
            slot.evictable = true;
        }
        assert!(entry.evict());
        assert_eq!(waiter.wait(), WakeStatus::Evicted);
    }

    #[test]
    fn reaper_recycles_stacks() {
        let range = VAddrRange {
            start: MIN_STACK_CLUSTER_VADDR + 212 * STACK_CLUSTER_SIZE,
            end: MIN_STACK_CLUSTER_VADDR + 213 * STACK_CLUSTER_SIZE,
        };
        let stacks = Arc::new(StackAllocator::new(range).unwrap());
        let reaper = Reaper::new(Arc::clone(&stacks));
        let stack = stacks.get();
        let lo = stack as u64;
        let uth = UThread::spawn(stack, || {}).unwrap();
        reaper.retire(uth);
        // Shutdown drains the queue, so the stack is back in some cache
        // (the reaper thread's core slot or the global pool).
        reaper.shutdown();
        let recycled = stacks.get();
        assert!((recycled as u64) >= MIN_STACK_CLUSTER_VADDR);
        assert!(recycled as u64 == lo || stacks.num_touched() >= 2);
        stacks.put(recycled);
    }
}
