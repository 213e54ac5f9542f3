use crate::commons::{
    mmap_fixed, munmap_fixed, rdtsc, NodeAddr, ProcletId, PROCLET_HEAP_SIZE, STACK_SIZE,
};
use crate::rcu::RcuLock;
use crate::slab::SlabAllocator;
use crate::sync::blocked_syncer::BlockedSyncer;
use crate::sync::time::ProcletClock;
use crate::sync::SpinLock;
use crate::uthread::ThreadEntry;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Space reserved at the base of each heap window for the header; the slab
/// arena covers the remainder.
pub const HEADER_RESERVED: u64 = 256 << 10;

static_assertions::const_assert!(mem::size_of::<ProcletHeader>() as u64 <= HEADER_RESERVED);

/// EWMA of CPU cycles charged to a proclet by its dispatch threads. The
/// ranking thread flushes all proclets on one cadence so their loads are
/// comparable.
pub struct CpuLoad {
    charged_cycles: AtomicU64,
    last_flush_tsc: AtomicU64,
    /// Load in milli-cores, stored flat so readers never lock.
    ewma_millicores: AtomicU32,
}

impl CpuLoad {
    const EWMA_SHIFT: u32 = 2; // new sample weighted 1/4

    pub fn new() -> CpuLoad {
        CpuLoad {
            charged_cycles: AtomicU64::new(0),
            last_flush_tsc: AtomicU64::new(rdtsc()),
            ewma_millicores: AtomicU32::new(0),
        }
    }

    pub fn charge(&self, cycles: u64) {
        self.charged_cycles.fetch_add(cycles, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        let now = rdtsc();
        let last = self.last_flush_tsc.swap(now, Ordering::Relaxed);
        let elapsed = now.saturating_sub(last).max(1);
        let charged = self.charged_cycles.swap(0, Ordering::Relaxed);
        let sample = ((charged * 1000) / elapsed).min(u64::from(u32::MAX)) as u32;
        let old = self.ewma_millicores.load(Ordering::Relaxed);
        let new = old - (old >> Self::EWMA_SHIFT) + (sample >> Self::EWMA_SHIFT);
        self.ewma_millicores.store(new, Ordering::Relaxed);
    }

    /// Current load in cores.
    pub fn load(&self) -> f32 {
        self.ewma_millicores.load(Ordering::Relaxed) as f32 / 1000.0
    }
}

impl Default for CpuLoad {
    fn default() -> CpuLoad {
        CpuLoad::new()
    }
}

struct HeaderState {
    ref_cnt: i64,
}

/// Metadata block at the base of every proclet heap window. Everything a
/// migration needs to know about the proclet that is not application state
/// lives here: the slab arena, the refcount, the set of threads currently
/// inside, the blocked-syncer registry, the RCU gate, and the logical
/// clock.
#[repr(C)]
pub struct ProcletHeader {
    id: ProcletId,
    /// Selector of the registered root type; resolves the construct /
    /// destruct / serialize shims on whichever node hosts the proclet.
    type_sel: u64,
    migratable: bool,
    migrating: AtomicBool,
    spin: SpinLock<HeaderState>,
    /// Gate between dispatch (readers) and migration quiesce (writer).
    pub rcu: RcuLock,
    pub blocked_syncer: BlockedSyncer,
    pub clock: ProcletClock,
    pub cpu_load: CpuLoad,
    threads: SpinLock<HashMap<u64, Arc<ThreadEntry>>>,
    thread_cnt: AtomicU32,
    /// In-window address of the root object's payload.
    root: AtomicU64,
    pub slab: SlabAllocator,
}

impl ProcletHeader {
    /// Writes a fresh header at `base` (the start of a mapped heap window)
    /// and hands back a reference with the window's lifetime.
    ///
    /// # Safety
    /// `base` must point at a mapped, writable window of
    /// `PROCLET_HEAP_SIZE` bytes that contains no live header.
    pub unsafe fn init_at(
        base: *mut u8,
        type_sel: u64,
        migratable: bool,
        clock: ProcletClock,
    ) -> &'static ProcletHeader {
        let id = ProcletId::from_heap_base(base);
        let slab_id = (id.0 >> 30) as u16;
        let header = base as *mut ProcletHeader;
        header.write(ProcletHeader {
            id,
            type_sel,
            migratable,
            migrating: AtomicBool::new(false),
            spin: SpinLock::new(HeaderState { ref_cnt: 0 }),
            rcu: RcuLock::new(),
            blocked_syncer: BlockedSyncer::new(),
            clock,
            cpu_load: CpuLoad::new(),
            threads: SpinLock::new(HashMap::new()),
            thread_cnt: AtomicU32::new(0),
            root: AtomicU64::new(0),
            slab: SlabAllocator::new(
                slab_id,
                base.add(HEADER_RESERVED as usize),
                (PROCLET_HEAP_SIZE - HEADER_RESERVED) as usize,
            ),
        });
        &*header
    }

    pub fn id(&self) -> ProcletId {
        self.id
    }

    pub fn type_sel(&self) -> u64 {
        self.type_sel
    }

    pub fn migratable(&self) -> bool {
        self.migratable
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    pub fn set_migrating(&self, migrating: bool) {
        self.migrating.store(migrating, Ordering::SeqCst);
    }

    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    pub fn set_root(&self, addr: u64) {
        self.root.store(addr, Ordering::Release);
    }

    /// Applies a refcount delta under the header spinlock and returns the
    /// new count. The count may only reach zero once.
    pub fn ref_cnt_add(&self, delta: i64) -> i64 {
        let mut st = self.spin.lock();
        st.ref_cnt += delta;
        bug_on!(st.ref_cnt < 0, "{} refcount went negative", self.id);
        st.ref_cnt
    }

    pub fn ref_cnt(&self) -> i64 {
        self.spin.lock().ref_cnt
    }

    /// Registers a dispatch thread as inside this proclet. The caller must
    /// already hold the header's RCU reader lock; together these form the
    /// migration-disabled region.
    pub fn attach_thread(&self, entry: &Arc<ThreadEntry>) {
        self.threads.lock().insert(entry.id(), Arc::clone(entry));
        self.thread_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach_thread(&self, entry: &ThreadEntry) {
        self.threads.lock().remove(&entry.id());
        self.thread_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn thread_cnt(&self) -> u32 {
        self.thread_cnt.load(Ordering::Acquire)
    }

    /// Wakes every evictable parked thread with the eviction status. Must
    /// run after `set_migrating(true)`; threads that race past the sweep
    /// re-check the flag before blocking.
    pub fn evict_parked_threads(&self) -> usize {
        let entries: Vec<_> = self.threads.lock().values().cloned().collect();
        entries.iter().filter(|e| e.evict()).count()
    }

    /// Bytes attributable to this proclet: header, slab usage, and the
    /// stacks of threads currently inside.
    pub fn mem_size(&self) -> u64 {
        HEADER_RESERVED
            + self.slab.usage()
            + u64::from(self.thread_cnt()) * STACK_SIZE as u64
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ProcletStatus {
    Absent = 0,
    Present = 1,
    Migrating = 2,
}

impl ProcletStatus {
    fn from_u8(v: u8) -> ProcletStatus {
        match v {
            1 => ProcletStatus::Present,
            2 => ProcletStatus::Migrating,
            _ => ProcletStatus::Absent,
        }
    }
}

/// Directory slot for one proclet on this node. Status transitions
/// serialize through CAS; readers go through the manager's RCU.
pub struct ProcletEntry {
    pub id: ProcletId,
    status: AtomicU8,
    /// Where the proclet went, once it has migrated away. Lets the
    /// dispatcher answer stale calls with `FORWARDED` + the new address.
    forward: SpinLock<Option<NodeAddr>>,
}

impl ProcletEntry {
    fn new(id: ProcletId) -> Arc<ProcletEntry> {
        Arc::new(ProcletEntry {
            id,
            status: AtomicU8::new(ProcletStatus::Absent as u8),
            forward: SpinLock::new(None),
        })
    }

    pub fn status(&self) -> ProcletStatus {
        ProcletStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ProcletStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn cas_status(&self, from: ProcletStatus, to: ProcletStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_forward(&self, addr: NodeAddr) {
        *self.forward.lock() = Some(addr);
    }

    /// A freed window may be reissued by the controller; a stale tombstone
    /// must not forward calls for the new tenant.
    pub fn clear_forward(&self) {
        *self.forward.lock() = None;
    }

    pub fn forward(&self) -> Option<NodeAddr> {
        *self.forward.lock()
    }

    /// # Safety
    /// Only meaningful while this node holds the window (status Present or
    /// Migrating) and the caller is inside the manager's RCU read section.
    pub unsafe fn header(&self) -> &ProcletHeader {
        &*(self.id.heap_base() as *const ProcletHeader)
    }
}

/// Tracks the set of proclets this node hosts (or hosted). Lookups run
/// under the manager's RCU reader lock; construct, destruct, and migration
/// cutover serialize through per-entry status CAS.
pub struct ProcletManager {
    pub rcu: RcuLock,
    entries: SpinLock<HashMap<ProcletId, Arc<ProcletEntry>>>,
}

impl ProcletManager {
    pub fn new() -> ProcletManager {
        ProcletManager {
            rcu: RcuLock::new(),
            entries: SpinLock::new(HashMap::new()),
        }
    }

    pub fn entry_or_insert(&self, id: ProcletId) -> Arc<ProcletEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(id).or_insert_with(|| ProcletEntry::new(id)))
    }

    pub fn get(&self, id: ProcletId) -> Option<Arc<ProcletEntry>> {
        self.entries.lock().get(&id).cloned()
    }

    /// IDs of proclets currently `Present`, for pressure ranking.
    pub fn present_ids(&self) -> Vec<ProcletId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.status() == ProcletStatus::Present)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn num_present(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.status() == ProcletStatus::Present)
            .count()
    }

    /// Maps the proclet's heap window at its fixed cluster-wide address.
    pub fn map_window(&self, id: ProcletId) -> io::Result<*mut u8> {
        let base = mmap_fixed(id.0, PROCLET_HEAP_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        debug!("mapped heap window for {}", id);
        Ok(base)
    }

    /// Tears down the header in the window and unmaps it. The entry stays
    /// behind as a tombstone carrying the forwarding address, if any.
    ///
    /// # Safety
    /// No thread may still be inside the proclet; the caller must have
    /// quiesced it (refcount zero path or migration cutover).
    pub unsafe fn unmap_window(&self, id: ProcletId) {
        let header = id.heap_base() as *mut ProcletHeader;
        std::ptr::drop_in_place(header);
        if let Err(err) = munmap_fixed(id.0, PROCLET_HEAP_SIZE) {
            debug!("failed to unmap {}: {}", id, err);
        }
        debug!("unmapped heap window for {}", id);
    }
}

impl Default for ProcletManager {
    fn default() -> ProcletManager {
        ProcletManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::MIN_HEAP_VADDR;

    // Unit tests use windows from the top of the heap range; integration
    // tests allocate from the bottom via a controller.
    fn test_window(idx: u64) -> ProcletId {
        ProcletId(MIN_HEAP_VADDR + (4000 + idx) * PROCLET_HEAP_SIZE)
    }

    #[test]
    fn header_lifecycle_and_refcount() {
        let mgr = ProcletManager::new();
        let id = test_window(0);
        let base = mgr.map_window(id).unwrap();
        let header =
            unsafe { ProcletHeader::init_at(base, 0xABCD, true, ProcletClock::new()) };
        assert_eq!(header.id(), id);
        assert_eq!(header.type_sel(), 0xABCD);
        assert_eq!(header.ref_cnt_add(1), 1);
        assert_eq!(header.ref_cnt_add(2), 3);
        assert_eq!(header.ref_cnt_add(-3), 0);

        let p = header.slab.allocate(128);
        assert!(!p.is_null());
        assert!((p as u64) > id.0 + HEADER_RESERVED);
        assert!((p as u64) < id.0 + PROCLET_HEAP_SIZE);
        header.slab.free(p);

        unsafe { mgr.unmap_window(id) };
    }

    #[test]
    fn entry_status_cas_serializes_transitions() {
        let mgr = ProcletManager::new();
        let entry = mgr.entry_or_insert(test_window(1));
        assert_eq!(entry.status(), ProcletStatus::Absent);
        entry.set_status(ProcletStatus::Present);
        assert!(entry.cas_status(ProcletStatus::Present, ProcletStatus::Migrating));
        assert!(!entry.cas_status(ProcletStatus::Present, ProcletStatus::Migrating));
        assert_eq!(entry.status(), ProcletStatus::Migrating);
        assert_eq!(mgr.num_present(), 0);
    }

    #[test]
    fn cpu_load_ewma_converges() {
        let load = CpuLoad::new();
        // Pretend the proclet burned ~half the elapsed cycles over several
        // flush intervals.
        for _ in 0..16 {
            let start = rdtsc();
            while rdtsc() < start + 200_000 {}
            load.charge(100_000);
            load.flush();
        }
        let l = load.load();
        assert!(l > 0.1 && l < 1.5, "load {} out of range", l);
    }

    #[test]
    fn mem_size_counts_slab_usage() {
        let mgr = ProcletManager::new();
        let id = test_window(2);
        let base = mgr.map_window(id).unwrap();
        let header = unsafe { ProcletHeader::init_at(base, 1, true, ProcletClock::new()) };
        let before = header.mem_size();
        let p = header.slab.allocate(4096);
        assert!(header.mem_size() > before);
        header.slab.free(p);
        unsafe { mgr.unmap_window(id) };
    }
}
