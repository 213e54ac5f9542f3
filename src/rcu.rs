use crate::commons::{cpu_slot, microtime, CachePadded, NUM_CPU_SLOTS};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Bound on the writer's cooperative-yield fast path before it starts
/// sleeping between scans.
const WRITER_FAST_PATH_MAX_US: u64 = 200;
const WRITER_SLOW_PATH_SLEEP_US: u64 = 1000;

#[derive(Default)]
struct Slot {
    cnt: AtomicI64,
    ver: AtomicU64,
}

/// Epoch-based reader/writer gate. Readers touch one per-core slot;
/// `writer_sync` waits until every reader that held the lock at the moment
/// the sync began has released it at least once.
///
/// The version stamp catches a reader that unlocks on one slot and re-locks
/// on another between two of the writer's scans: the counts would sum to
/// zero both times, but the slot versions move.
pub struct RcuLock {
    sync_barrier: AtomicBool,
    prioritize_readers: AtomicBool,
    slots: [CachePadded<Slot>; NUM_CPU_SLOTS],
}

impl RcuLock {
    pub fn new() -> RcuLock {
        RcuLock {
            sync_barrier: AtomicBool::new(false),
            prioritize_readers: AtomicBool::new(false),
            slots: array_init::array_init(|_| CachePadded(Slot::default())),
        }
    }

    /// Wait-free except while a writer sync is in progress, in which case
    /// the reader yields until the barrier drops so it cannot starve the
    /// writer by perpetually re-entering.
    pub fn reader_lock(&self) {
        while self.sync_barrier.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        let slot = &self.slots[cpu_slot()].0;
        slot.cnt.fetch_add(1, Ordering::AcqRel);
        slot.ver.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reader_unlock(&self) {
        let slot = &self.slots[cpu_slot()].0;
        slot.cnt.fetch_sub(1, Ordering::AcqRel);
        slot.ver.fetch_add(1, Ordering::AcqRel);
    }

    /// Blocks until every critical section that was open when the call
    /// began has closed. With `prioritize_readers` the writer never sleeps,
    /// keeping the CPU available to readers that are draining.
    pub fn writer_sync(&self, prioritize_readers: bool) {
        self.prioritize_readers
            .store(prioritize_readers, Ordering::Relaxed);
        self.sync_barrier.store(true, Ordering::SeqCst);

        let start_us = microtime();
        let mut snapshot = [0u64; NUM_CPU_SLOTS];
        'retry: loop {
            let mut sum = 0i64;
            for (i, slot) in self.slots.iter().enumerate() {
                snapshot[i] = slot.0.ver.load(Ordering::Acquire);
                sum += slot.0.cnt.load(Ordering::Acquire);
            }
            if sum != 0 {
                if prioritize_readers || microtime() < start_us + WRITER_FAST_PATH_MAX_US {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(Duration::from_micros(WRITER_SLOW_PATH_SLEEP_US));
                }
                continue 'retry;
            }
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.0.ver.load(Ordering::Acquire) != snapshot[i] {
                    continue 'retry;
                }
            }
            break;
        }

        self.sync_barrier.store(false, Ordering::SeqCst);
        self.prioritize_readers.store(false, Ordering::Relaxed);
    }

    /// RAII reader section.
    pub fn read(&self) -> RcuReadGuard<'_> {
        self.reader_lock();
        RcuReadGuard { lock: self }
    }
}

impl Default for RcuLock {
    fn default() -> RcuLock {
        RcuLock::new()
    }
}

pub struct RcuReadGuard<'a> {
    lock: &'a RcuLock,
}

impl<'a> Drop for RcuReadGuard<'a> {
    fn drop(&mut self) {
        self.lock.reader_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn writer_sync_waits_for_open_sections() {
        let rcu = Arc::new(RcuLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(usize::MAX));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let rcu = Arc::clone(&rcu);
            let inside = Arc::clone(&inside);
            readers.push(std::thread::spawn(move || {
                let guard = rcu.read();
                inside.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                inside.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }));
        }

        // Give readers a moment to enter their sections.
        std::thread::sleep(Duration::from_millis(5));
        rcu.writer_sync(false);
        observed.store(inside.load(Ordering::SeqCst), Ordering::SeqCst);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn uncontended_sync_returns_immediately() {
        let rcu = RcuLock::new();
        rcu.reader_lock();
        rcu.reader_unlock();
        rcu.writer_sync(true);
    }
}
