use crate::error::Evicted;
use crate::runtime::{self, DispatchCtx};
use crate::sync::blocked_syncer::SyncerKind;
use crate::sync::{SpinLock, Waiter, WakeStatus};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Wait-blocking mutex for proclet state. While any thread is parked on it,
/// the mutex is registered in the owning proclet's blocked-syncer set, which
/// is how migration discovers every wait point it must account for.
///
/// `lock` returns `Err(Evicted)` when the proclet starts migrating while the
/// caller is parked; the handler unwinds, the caller's RPC is re-issued at
/// the destination, and the lock attempt repeats there against the
/// transferred state.
pub struct Mutex<T> {
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

struct MutexState {
    held: bool,
    waiters: VecDeque<Arc<Waiter>>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Mutex<T> {
        Mutex {
            state: SpinLock::new(MutexState {
                held: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    fn addr(&self) -> u64 {
        self as *const Mutex<T> as u64
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>, Evicted> {
        let ctx = runtime::dispatch_ctx();
        loop {
            let mut st = self.state.lock();
            if !st.held {
                st.held = true;
                return Ok(MutexGuard { mutex: self });
            }
            let waiter = Arc::new(Waiter::new());
            st.waiters.push_back(Arc::clone(&waiter));
            let first = st.waiters.len() == 1;
            drop(st);

            match park(&ctx, self.addr(), SyncerKind::Mutex, first, &waiter) {
                WakeStatus::Notified => continue,
                WakeStatus::Evicted => {
                    self.forget_waiter(&waiter);
                    return Err(Evicted);
                }
                WakeStatus::Timeout => unreachable!("mutex parks have no deadline"),
            }
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.held {
            None
        } else {
            st.held = true;
            Some(MutexGuard { mutex: self })
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        let mut st = self.state.lock();
        st.held = false;
        while let Some(w) = st.waiters.pop_front() {
            // A popped waiter may have already been evicted; skip it and
            // try the next. wake() reports whether this wake landed.
            if w.wake(WakeStatus::Notified) {
                break;
            }
        }
        let empty = st.waiters.is_empty();
        drop(st);
        if empty {
            deregister(self.addr());
        }
    }

    /// Drops an evicted waiter from the queue; an unlock may have already
    /// popped it, in which case there is nothing to remove.
    fn forget_waiter(&self, waiter: &Arc<Waiter>) {
        let mut st = self.state.lock();
        st.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        let empty = st.waiters.is_empty();
        drop(st);
        if empty {
            deregister(self.addr());
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

/// Parks the calling thread on `waiter`. Inside a proclet the park is
/// evictable and ordered against the migrating flag; outside (runtime
/// threads, unit tests) it is a plain block.
pub(crate) fn park(
    ctx: &Option<DispatchCtx>,
    addr: u64,
    kind: SyncerKind,
    first_waiter: bool,
    waiter: &Arc<Waiter>,
) -> WakeStatus {
    match ctx {
        Some(ctx) => {
            let header = ctx.header();
            if first_waiter {
                header.blocked_syncer.add(addr, kind);
            }
            ctx.entry.publish_wait(waiter, true);
            if header.is_migrating() {
                // The eviction sweep may have run before our publish; treat
                // the park as evicted either way.
                ctx.entry.clear_wait();
                return WakeStatus::Evicted;
            }
            let status = waiter.wait();
            ctx.entry.clear_wait();
            status
        }
        None => waiter.wait(),
    }
}

pub(crate) fn deregister(addr: u64) {
    if let Some(ctx) = runtime::dispatch_ctx() {
        ctx.header().blocked_syncer.remove(addr);
    }
}

pub struct MutexGuard<'a, T> {
    pub(crate) mutex: &'a Mutex<T>,
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

// Mutex state crosses the wire only while its proclet is quiesced: no
// holders, no waiters. Only the protected data is serialized; the
// destination starts with an unheld mutex whose waiter list refills as the
// evicted calls re-issue and park again.
impl<T: Serialize> Serialize for Mutex<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        unsafe { &*self.data.get() }.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Mutex<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Mutex<T>, D::Error> {
        T::deserialize(deserializer).map(Mutex::new)
    }
}
