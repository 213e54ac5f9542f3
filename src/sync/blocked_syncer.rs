use crate::sync::SpinLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const NUM_BUCKETS: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncerKind {
    Mutex = 0,
    CondVar = 1,
}

/// Per-proclet registry of every mutex and condvar that currently has
/// parked waiters, keyed by the syncer's in-heap address. Migration reads
/// it to know which wait points exist inside the proclet being moved; each
/// entry is re-established at the destination as the evicted calls re-park.
pub struct BlockedSyncer {
    buckets: [SpinLock<HashMap<u64, SyncerKind>>; NUM_BUCKETS],
}

impl BlockedSyncer {
    pub fn new() -> BlockedSyncer {
        BlockedSyncer {
            buckets: array_init::array_init(|_| SpinLock::new(HashMap::new())),
        }
    }

    fn bucket(&self, addr: u64) -> &SpinLock<HashMap<u64, SyncerKind>> {
        // The low bits of an in-slab address are alignment; mix the middle.
        &self.buckets[(addr >> 4) as usize % NUM_BUCKETS]
    }

    pub fn add(&self, addr: u64, kind: SyncerKind) {
        self.bucket(addr).lock().insert(addr, kind);
    }

    pub fn remove(&self, addr: u64) {
        self.bucket(addr).lock().remove(&addr);
    }

    pub fn snapshot(&self) -> Vec<(u64, SyncerKind)> {
        let mut all = Vec::new();
        for bucket in &self.buckets {
            for (addr, kind) in bucket.lock().iter() {
                all.push((*addr, *kind));
            }
        }
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockedSyncer {
    fn default() -> BlockedSyncer {
        BlockedSyncer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_snapshot() {
        let bs = BlockedSyncer::new();
        bs.add(0x1000, SyncerKind::Mutex);
        bs.add(0x2000, SyncerKind::CondVar);
        assert_eq!(bs.len(), 2);
        let mut snap = bs.snapshot();
        snap.sort();
        assert_eq!(
            snap,
            vec![(0x1000, SyncerKind::Mutex), (0x2000, SyncerKind::CondVar)]
        );
        bs.remove(0x1000);
        assert_eq!(bs.len(), 1);
        bs.remove(0x2000);
        assert!(bs.is_empty());
    }

    #[test]
    fn re_adding_same_address_is_idempotent() {
        let bs = BlockedSyncer::new();
        bs.add(0x40, SyncerKind::Mutex);
        bs.add(0x40, SyncerKind::Mutex);
        assert_eq!(bs.len(), 1);
    }
}
