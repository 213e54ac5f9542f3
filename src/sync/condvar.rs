use crate::error::Evicted;
use crate::runtime;
use crate::sync::blocked_syncer::SyncerKind;
use crate::sync::mutex::{deregister, park, Mutex, MutexGuard};
use crate::sync::{SpinLock, Waiter, WakeStatus};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::Arc;

/// Condition variable paired with `sync::Mutex`. Waiters are registered in
/// the owning proclet's blocked-syncer set exactly while the wait queue is
/// non-empty, mirroring the mutex.
pub struct CondVar {
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl CondVar {
    pub fn new() -> CondVar {
        CondVar {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    fn addr(&self) -> u64 {
        self as *const CondVar as u64
    }

    /// Atomically releases `guard`'s mutex and parks; re-acquires on wake.
    /// The waiter is enqueued before the unlock, so a notify issued by the
    /// next lock holder can never be lost.
    pub fn wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>, Evicted> {
        let mutex: &'a Mutex<T> = guard.mutex;
        let waiter = Arc::new(Waiter::new());
        let first = {
            let mut q = self.waiters.lock();
            q.push_back(Arc::clone(&waiter));
            q.len() == 1
        };
        drop(guard);

        let ctx = runtime::dispatch_ctx();
        match park(&ctx, self.addr(), SyncerKind::CondVar, first, &waiter) {
            WakeStatus::Notified => mutex.lock(),
            WakeStatus::Evicted => {
                self.forget_waiter(&waiter);
                Err(Evicted)
            }
            WakeStatus::Timeout => unreachable!("condvar waits have no deadline"),
        }
    }

    pub fn notify_one(&self) {
        let mut q = self.waiters.lock();
        while let Some(w) = q.pop_front() {
            if w.wake(WakeStatus::Notified) {
                break;
            }
        }
        let empty = q.is_empty();
        drop(q);
        if empty {
            deregister(self.addr());
        }
    }

    pub fn notify_all(&self) {
        let mut q = self.waiters.lock();
        let all: Vec<_> = q.drain(..).collect();
        drop(q);
        for w in all {
            w.wake(WakeStatus::Notified);
        }
        deregister(self.addr());
    }

    fn forget_waiter(&self, waiter: &Arc<Waiter>) {
        let mut q = self.waiters.lock();
        q.retain(|w| !Arc::ptr_eq(w, waiter));
        let empty = q.is_empty();
        drop(q);
        if empty {
            deregister(self.addr());
        }
    }
}

impl Default for CondVar {
    fn default() -> CondVar {
        CondVar::new()
    }
}

// Like the mutex, a condvar only crosses the wire quiesced (no waiters), so
// its serialized form is empty.
impl Serialize for CondVar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for CondVar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<CondVar, D::Error> {
        <()>::deserialize(deserializer).map(|_| CondVar::new())
    }
}
