use crate::commons::{cpu_slot, CachePadded, NUM_CPU_SLOTS};
use crate::sync::SpinLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::io;

/// Per-core caches of connections keyed by peer, backed by a global
/// spillover pool. A connection handed out by `get` is owned by the caller
/// until `put`; nothing here is reference counted.
pub struct ConnectionManager<K, C> {
    per_core: Vec<CachePadded<SpinLock<HashMap<K, Vec<C>>>>>,
    global: SpinLock<HashMap<K, Vec<C>>>,
    creator: Box<dyn Fn(&K) -> io::Result<C> + Send + Sync>,
    per_core_cache_size: usize,
}

impl<K: Eq + Hash + Clone, C> ConnectionManager<K, C> {
    pub fn new<F>(per_core_cache_size: usize, creator: F) -> ConnectionManager<K, C>
    where
        F: Fn(&K) -> io::Result<C> + Send + Sync + 'static,
    {
        let mut per_core = Vec::with_capacity(NUM_CPU_SLOTS);
        for _ in 0..NUM_CPU_SLOTS {
            per_core.push(CachePadded(SpinLock::new(HashMap::new())));
        }
        ConnectionManager {
            per_core,
            global: SpinLock::new(HashMap::new()),
            creator: Box::new(creator),
            per_core_cache_size,
        }
    }

    /// Returns a connection to `k`. Empty per-core cache refills from the
    /// global pool; an empty global pool triggers one batch of
    /// `per_core_cache_size` fresh connections.
    pub fn get(&self, k: &K) -> io::Result<C> {
        {
            let mut cache = self.per_core[cpu_slot()].0.lock();
            if let Some(conns) = cache.get_mut(k) {
                if let Some(c) = conns.pop() {
                    return Ok(c);
                }
            }
        }

        {
            let mut global = self.global.lock();
            if let Some(conns) = global.get_mut(k) {
                if let Some(c) = conns.pop() {
                    // Move a refill along with the one we take.
                    let mut moved = Vec::new();
                    while moved.len() + 1 < self.per_core_cache_size {
                        match conns.pop() {
                            Some(extra) => moved.push(extra),
                            None => break,
                        }
                    }
                    drop(global);
                    if !moved.is_empty() {
                        let mut cache = self.per_core[cpu_slot()].0.lock();
                        cache.entry(k.clone()).or_default().append(&mut moved);
                    }
                    return Ok(c);
                }
            }
        }

        // Both caches empty: open a batch, return one, cache the rest.
        let first = (self.creator)(k)?;
        let mut batch = Vec::new();
        for _ in 1..self.per_core_cache_size {
            batch.push((self.creator)(k)?);
        }
        if !batch.is_empty() {
            let mut cache = self.per_core[cpu_slot()].0.lock();
            cache.entry(k.clone()).or_default().append(&mut batch);
        }
        Ok(first)
    }

    /// Returns `c` to the per-core cache, spilling half to the global pool
    /// past the watermark.
    pub fn put(&self, k: &K, c: C) {
        let watermark = self.per_core_cache_size * 2;
        let mut cache = self.per_core[cpu_slot()].0.lock();
        let conns = cache.entry(k.clone()).or_default();
        conns.push(c);
        if conns.len() > watermark {
            let spill: Vec<C> = conns.drain(..conns.len() / 2).collect();
            drop(cache);
            self.global
                .lock()
                .entry(k.clone())
                .or_default()
                .extend(spill);
        }
    }

    /// Eagerly opens `n` connections to `k` into the global pool.
    pub fn reserve(&self, k: &K, n: usize) -> io::Result<()> {
        let mut fresh = Vec::with_capacity(n);
        for _ in 0..n {
            fresh.push((self.creator)(k)?);
        }
        self.global
            .lock()
            .entry(k.clone())
            .or_default()
            .extend(fresh);
        Ok(())
    }

    /// Drains every cached connection, handing each to `f` for shutdown.
    pub fn drain<F: FnMut(C)>(&self, mut f: F) {
        for slot in &self.per_core {
            let mut cache = slot.0.lock();
            for (_, conns) in cache.drain() {
                for c in conns {
                    f(c);
                }
            }
        }
        let mut global = self.global.lock();
        for (_, conns) in global.drain() {
            for c in conns {
                f(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_manager(
        cache_size: usize,
    ) -> (ConnectionManager<&'static str, usize>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&counter);
        let mgr = ConnectionManager::new(cache_size, move |_k: &&str| {
            Ok(c2.fetch_add(1, Ordering::SeqCst))
        });
        (mgr, counter)
    }

    #[test]
    fn empty_caches_trigger_one_batch() {
        let (mgr, counter) = counting_manager(4);
        let c = mgr.get(&"peer").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4, "one batch of cache size");
        mgr.put(&"peer", c);
        // Subsequent gets come from cache without new connections.
        for _ in 0..4 {
            let c = mgr.get(&"peer").unwrap();
            mgr.put(&"peer", c);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn reserve_fills_global_pool() {
        let (mgr, counter) = counting_manager(2);
        mgr.reserve(&"peer", 6).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        // get prefers the reserved pool over dialing.
        let _c = mgr.get(&"peer").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn overfull_per_core_cache_spills_to_global() {
        let (mgr, _counter) = counting_manager(2);
        // Watermark is 2 * cache size = 4; the fifth put spills half.
        for i in 0..5 {
            mgr.put(&"peer", 100 + i);
        }
        let spilled = {
            let global = mgr.global.lock();
            global.get(&"peer").map(|v| v.len()).unwrap_or(0)
        };
        assert!(spilled >= 2, "expected a spill, got {}", spilled);
    }

    #[test]
    fn drain_visits_everything() {
        let (mgr, _) = counting_manager(3);
        mgr.reserve(&"a", 2).unwrap();
        mgr.put(&"b", 99);
        let mut seen = 0;
        mgr.drain(|_| seen += 1);
        assert_eq!(seen, 3);
    }
}
