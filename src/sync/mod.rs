pub mod blocked_syncer;
pub mod condvar;
pub mod mutex;
pub mod time;

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar as StdCondvar, Mutex as StdMutex};
use std::time::Instant;

/// Short spinlock guarding header fields and cache slots. Critical sections
/// under a `SpinLock` must not block.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(data: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins = 0u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                // Cooperative backoff once the owner is clearly descheduled.
                std::thread::yield_now();
            }
        }
        SpinGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(T::default())
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// How a parked thread was released.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WakeStatus {
    /// A peer handed over whatever was waited for (mutex release, condvar
    /// notify, RPC completion).
    Notified,
    /// The owning proclet entered migration; the waiter must unwind.
    Evicted,
    /// The deadline passed before anyone woke us.
    Timeout,
}

/// One-shot wait point. Every park allocates a fresh `Waiter` so a stale
/// wake from a previous park can never be confused with a new one; waiters
/// are shared between the parked thread and whoever will wake it.
pub struct Waiter {
    state: StdMutex<Option<WakeStatus>>,
    cv: StdCondvar,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter {
            state: StdMutex::new(None),
            cv: StdCondvar::new(),
        }
    }

    /// Blocks until `wake` is called. First wake wins; later wakes are
    /// ignored.
    pub fn wait(&self) -> WakeStatus {
        let mut state = self.state.lock().unwrap();
        while state.is_none() {
            state = self.cv.wait(state).unwrap();
        }
        state.unwrap()
    }

    /// Blocks until `wake` or until `deadline`.
    pub fn wait_deadline(&self, deadline: Instant) -> WakeStatus {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(status) = *state {
                return status;
            }
            let now = Instant::now();
            if now >= deadline {
                *state = Some(WakeStatus::Timeout);
                return WakeStatus::Timeout;
            }
            let (next, timeout) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if timeout.timed_out() && state.is_none() {
                *state = Some(WakeStatus::Timeout);
                return WakeStatus::Timeout;
            }
        }
    }

    /// Releases the parked thread. Returns false if the waiter had already
    /// been woken (or timed out), in which case `status` was not delivered.
    pub fn wake(&self, status: WakeStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return false;
        }
        *state = Some(status);
        self.cv.notify_one();
        true
    }
}

impl Default for Waiter {
    fn default() -> Waiter {
        Waiter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn spin_lock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn waiter_delivers_first_wake_only() {
        let w = Arc::new(Waiter::new());
        let w2 = Arc::clone(&w);
        let th = std::thread::spawn(move || w2.wait());
        std::thread::sleep(Duration::from_millis(10));
        assert!(w.wake(WakeStatus::Notified));
        assert!(!w.wake(WakeStatus::Evicted));
        assert_eq!(th.join().unwrap(), WakeStatus::Notified);
    }

    #[test]
    fn waiter_timeout() {
        let w = Waiter::new();
        let status = w.wait_deadline(Instant::now() + Duration::from_millis(5));
        assert_eq!(status, WakeStatus::Timeout);
        // A late wake must report that it lost the race.
        assert!(!w.wake(WakeStatus::Notified));
    }
}
