use crate::commons::{ProcletId, Resource};
use crate::proclet::ProcletStatus;
use crate::runtime::Runtime;
use crate::sync::{SpinLock, Waiter, WakeStatus};
use log::{debug, info};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Cadence of the ranking thread and the main handler's poll of the shared
/// region.
const RANKING_INTERVAL_MS: u64 = 100;
const POLL_INTERVAL_MS: u64 = 2;
/// Under CPU pressure at least this many proclets leave per handling pass.
const MIN_PROCLETS_PER_CPU_MIGRATION: usize = 2;
const NUM_AUX_HANDLERS: usize = 2;
/// Migration-time model: fixed setup cost plus bytes over the link.
const MIGRATION_FIXED_COST_US: f32 = 30.0;
const NET_BW_GBPS: f32 = 10.0;

pub const STATUS_NONE: u32 = 0;
pub const STATUS_PENDING: u32 = 1;
pub const STATUS_HANDLED: u32 = 2;

/// Read-only congestion counters published by the host scheduler.
#[repr(C)]
#[derive(Default)]
pub struct CongestionInfo {
    /// f32 bits.
    pub load: AtomicU32,
    pub delay_us: AtomicU32,
    pub free_mem_mbs: AtomicU32,
    pub idle_num_cores: AtomicU32,
}

/// Pressure channel between the host scheduler and the runtime; the
/// runtime acknowledges by writing `status` and may raise mock pressure in
/// tests.
#[repr(C)]
#[derive(Default)]
pub struct ResourcePressureInfo {
    pub to_release_mem_mbs: AtomicU32,
    pub cpu_pressure: AtomicBool,
    pub status: AtomicU32,
    pub mock: AtomicBool,
}

#[repr(C)]
#[derive(Default)]
pub struct SharedRegion {
    pub congestion: CongestionInfo,
    pub pressure: ResourcePressureInfo,
}

/// Maps the scheduler's shared region, or fabricates a private one when no
/// path is configured (single host, tests).
fn map_region(path: Option<&Path>) -> &'static SharedRegion {
    match path {
        None => Box::leak(Box::new(SharedRegion::default())),
        Some(path) => {
            use nix::sys::mman::{mmap, MapFlags, ProtFlags};
            use std::os::unix::io::AsRawFd;
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .unwrap_or_else(|e| bug!("cannot open pressure shm {}: {}", path.display(), e));
            let len = std::mem::size_of::<SharedRegion>();
            file.set_len(len as u64)
                .unwrap_or_else(|e| bug!("cannot size pressure shm: {}", e));
            let p = unsafe {
                mmap(
                    std::ptr::null_mut(),
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            }
            .unwrap_or_else(|e| bug!("cannot map pressure shm: {}", e));
            unsafe { &*(p as *const SharedRegion) }
        }
    }
}

/// One proclet's standing in the migration rankings. Higher utility means
/// more relief per microsecond of migration time.
#[derive(Copy, Clone, Debug)]
struct Utility {
    id: ProcletId,
    mem_size: u64,
    cpu_load: f32,
    cpu_util: f32,
    mem_util: f32,
}

impl Utility {
    fn compute(id: ProcletId, mem_size: u64, cpu_load: f32) -> Utility {
        let migration_time_us =
            MIGRATION_FIXED_COST_US + mem_size as f32 / (NET_BW_GBPS / 8.0) / 1000.0;
        Utility {
            id,
            mem_size,
            cpu_load,
            cpu_util: cpu_load / migration_time_us,
            mem_util: mem_size as f32 / migration_time_us,
        }
    }
}

#[derive(Default)]
struct Rankings {
    by_cpu: Vec<Utility>,
    by_mem: Vec<Utility>,
}

/// Fixed pool of auxiliary handler threads that take migration work off
/// the main handler so it is not I/O-bound.
struct AuxPool {
    jobs: SpinLock<VecDeque<Box<dyn FnOnce() + Send>>>,
    job_waiters: SpinLock<VecDeque<Arc<Waiter>>>,
    done: AtomicBool,
}

impl AuxPool {
    fn new() -> Arc<AuxPool> {
        Arc::new(AuxPool {
            jobs: SpinLock::new(VecDeque::new()),
            job_waiters: SpinLock::new(VecDeque::new()),
            done: AtomicBool::new(false),
        })
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        self.jobs.lock().push_back(job);
        if let Some(w) = self.job_waiters.lock().pop_front() {
            w.wake(WakeStatus::Notified);
        }
    }

    fn worker_loop(&self) {
        loop {
            if self.done.load(Ordering::Acquire) {
                return;
            }
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None => {
                    let waiter = Arc::new(Waiter::new());
                    self.job_waiters.lock().push_back(Arc::clone(&waiter));
                    // Re-check before sleeping so a submit between the pop
                    // and the push is not lost.
                    if self.jobs.lock().is_empty() && !self.done.load(Ordering::Acquire) {
                        waiter.wait_deadline(
                            std::time::Instant::now() + Duration::from_millis(50),
                        );
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        let waiters: Vec<_> = self.job_waiters.lock().drain(..).collect();
        for w in waiters {
            w.wake(WakeStatus::Notified);
        }
    }
}

struct Inner {
    rt: Weak<Runtime>,
    region: &'static SharedRegion,
    rankings: SpinLock<Rankings>,
    aux: Arc<AuxPool>,
    done: AtomicBool,
    threads: SpinLock<Vec<std::thread::JoinHandle<()>>>,
}

/// Observes host-scheduler pressure, ranks local proclets by utility, and
/// drives the migrator until the pressure is relieved.
#[derive(Clone)]
pub struct PressureHandler {
    inner: Arc<Inner>,
}

impl PressureHandler {
    pub fn start(rt: &Arc<Runtime>, shm: Option<&Path>) -> PressureHandler {
        let inner = Arc::new(Inner {
            rt: Arc::downgrade(rt),
            region: map_region(shm),
            rankings: SpinLock::new(Rankings::default()),
            aux: AuxPool::new(),
            done: AtomicBool::new(false),
            threads: SpinLock::new(Vec::new()),
        });
        let handler = PressureHandler {
            inner: Arc::clone(&inner),
        };

        let mut threads = Vec::new();
        {
            let h = handler.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("drift-pressure-rank".into())
                    .spawn(move || h.ranking_loop())
                    .expect("spawn ranking thread"),
            );
        }
        {
            let h = handler.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("drift-pressure-main".into())
                    .spawn(move || h.main_loop())
                    .expect("spawn pressure handler"),
            );
        }
        for i in 0..NUM_AUX_HANDLERS {
            let aux = Arc::clone(&inner.aux);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("drift-pressure-aux{}", i))
                    .spawn(move || aux.worker_loop())
                    .expect("spawn aux handler"),
            );
        }
        *inner.threads.lock() = threads;
        handler
    }

    pub fn region(&self) -> &'static SharedRegion {
        self.inner.region
    }

    /// Raises synthetic pressure through the same shared region the host
    /// scheduler writes, so the whole handling path is exercised.
    pub fn mock_set_pressure(&self, cpu: bool) {
        let p = &self.inner.region.pressure;
        if cpu {
            p.cpu_pressure.store(true, Ordering::Release);
        } else {
            p.to_release_mem_mbs.store(u32::MAX, Ordering::Release);
        }
        p.mock.store(true, Ordering::Release);
        p.status.store(STATUS_PENDING, Ordering::Release);
    }

    pub fn mock_clear_pressure(&self) {
        let p = &self.inner.region.pressure;
        p.to_release_mem_mbs.store(0, Ordering::Release);
        p.cpu_pressure.store(false, Ordering::Release);
        p.mock.store(false, Ordering::Release);
    }

    /// True once the last raised pressure has been acknowledged.
    pub fn is_handled(&self) -> bool {
        self.inner.region.pressure.status.load(Ordering::Acquire) == STATUS_HANDLED
    }

    fn has_pressure(&self) -> bool {
        let p = &self.inner.region.pressure;
        p.to_release_mem_mbs.load(Ordering::Acquire) > 0
            || p.cpu_pressure.load(Ordering::Acquire)
    }

    fn ranking_loop(&self) {
        while !self.inner.done.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(RANKING_INTERVAL_MS));
            let rt = match self.inner.rt.upgrade() {
                Some(rt) => rt,
                None => return,
            };
            self.update_rankings(&rt);
        }
    }

    fn update_rankings(&self, rt: &Arc<Runtime>) {
        let mgr = rt.proclets();
        let mut utilities = Vec::new();
        for id in mgr.present_ids() {
            let _dir = mgr.rcu.read();
            let entry = match mgr.get(id) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.status() != ProcletStatus::Present {
                continue;
            }
            let header = unsafe { entry.header() };
            if !header.migratable() {
                continue;
            }
            header.cpu_load.flush();
            utilities.push(Utility::compute(
                id,
                header.mem_size(),
                header.cpu_load.load(),
            ));
        }

        let mut by_cpu = utilities.clone();
        by_cpu.sort_by(|a, b| b.cpu_util.partial_cmp(&a.cpu_util).unwrap());
        let mut by_mem = utilities;
        by_mem.sort_by(|a, b| b.mem_util.partial_cmp(&a.mem_util).unwrap());
        let mut rankings = self.inner.rankings.lock();
        rankings.by_cpu = by_cpu;
        rankings.by_mem = by_mem;
    }

    fn main_loop(&self) {
        while !self.inner.done.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            if !self.has_pressure() {
                continue;
            }
            let rt = match self.inner.rt.upgrade() {
                Some(rt) => rt,
                None => return,
            };
            self.handle(&rt);
        }
    }

    fn handle(&self, rt: &Arc<Runtime>) {
        let p = &self.inner.region.pressure;
        while self.has_pressure() {
            let cpu = p.cpu_pressure.load(Ordering::Acquire);
            let min_num = if cpu { MIN_PROCLETS_PER_CPU_MIGRATION } else { 0 };
            let min_mem = p.to_release_mem_mbs.load(Ordering::Acquire);
            debug!(
                "pressure: cpu {}, to_release {} MB",
                cpu,
                min_mem
            );

            // A freshly raised signal may predate the last ranking pass.
            self.update_rankings(rt);
            let (tasks, resource) = self.pick_tasks(rt, cpu, min_num, min_mem);
            if tasks.is_empty() {
                if p.mock.load(Ordering::Acquire) {
                    self.mock_clear_pressure();
                }
                break;
            }

            let migrated = self.migrate_batch(rt, resource, tasks);
            info!("pressure pass migrated {} proclets", migrated);
            if migrated == 0 {
                break;
            }
            if p.mock.load(Ordering::Acquire) {
                self.mock_clear_pressure();
                break;
            }
        }

        // Acknowledge to the host scheduler.
        p.mock.store(false, Ordering::Release);
        p.status.store(STATUS_HANDLED, Ordering::Release);
    }

    /// Walks the appropriate ranking, skipping pinned or already moving
    /// proclets, until the requested relief is covered.
    fn pick_tasks(
        &self,
        rt: &Arc<Runtime>,
        cpu: bool,
        min_num: usize,
        min_mem_mbs: u32,
    ) -> (Vec<ProcletId>, Resource) {
        let mgr = rt.proclets();
        let rankings = self.inner.rankings.lock();
        let ranked = if cpu { &rankings.by_cpu } else { &rankings.by_mem };

        let mut picked = Vec::new();
        let mut resource = Resource::default();
        for u in ranked.iter() {
            let done =
                resource.mem_mbs >= min_mem_mbs && picked.len() >= min_num && !picked.is_empty();
            if done {
                break;
            }
            let entry = match mgr.get(u.id) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.status() != ProcletStatus::Present {
                continue;
            }
            picked.push(u.id);
            resource.mem_mbs += (u.mem_size >> 20) as u32;
            resource.cores += u.cpu_load.ceil() as u32;
        }
        (picked, resource)
    }

    /// Splits the batch across the aux handlers so the main handler is not
    /// serialized behind the transfer I/O.
    fn migrate_batch(&self, rt: &Arc<Runtime>, resource: Resource, tasks: Vec<ProcletId>) -> usize {
        if tasks.is_empty() {
            return 0;
        }
        let migrated = Arc::new(AtomicUsize::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let latch = Arc::new(Waiter::new());

        let chunk = (tasks.len() + NUM_AUX_HANDLERS - 1) / NUM_AUX_HANDLERS;
        for part in tasks.chunks(chunk) {
            let part: Vec<ProcletId> = part.to_vec();
            let rt = Arc::clone(rt);
            let migrated = Arc::clone(&migrated);
            let pending = Arc::clone(&pending);
            let latch = Arc::clone(&latch);
            pending.fetch_add(1, Ordering::AcqRel);
            self.inner.aux.submit(Box::new(move || {
                let n = rt.migrator().migrate(&rt, resource, &part);
                migrated.fetch_add(n, Ordering::AcqRel);
                if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    latch.wake(WakeStatus::Notified);
                }
            }));
        }
        latch.wait();
        migrated.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.aux.shutdown();
        let threads: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for th in threads {
            let _ = th.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utility_prefers_cheap_high_load_proclets() {
        let hot = Utility::compute(ProcletId(1), 1 << 20, 2.0);
        let cold = Utility::compute(ProcletId(2), 1 << 20, 0.1);
        assert!(hot.cpu_util > cold.cpu_util);

        let big = Utility::compute(ProcletId(3), 1 << 30, 1.0);
        let small = Utility::compute(ProcletId(4), 1 << 20, 1.0);
        // Per migration-microsecond, the bigger proclet still frees more
        // memory on a fat link.
        assert!(big.mem_util > 0.0 && small.mem_util > 0.0);
    }

    #[test]
    fn mock_pressure_round_trips_through_region() {
        let region = map_region(None);
        region
            .pressure
            .to_release_mem_mbs
            .store(64, Ordering::Release);
        assert_eq!(region.pressure.to_release_mem_mbs.load(Ordering::Acquire), 64);
        region.pressure.status.store(STATUS_HANDLED, Ordering::Release);
        assert_eq!(region.pressure.status.load(Ordering::Acquire), STATUS_HANDLED);
    }

    #[test]
    fn aux_pool_runs_jobs() {
        let pool = AuxPool::new();
        let worker = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.worker_loop())
        };
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
        pool.shutdown();
        worker.join().unwrap();
    }
}
