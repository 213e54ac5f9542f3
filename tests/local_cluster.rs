//! End-to-end scenarios on an in-process cluster: one controller plus two
//! server runtimes with distinct loopback addresses, so calls, refcounts,
//! and migrations all cross real TCP connections.

#[macro_use]
extern crate lazy_static;

use drift::config::{Config, HostSchedConfig};
use drift::ctrl::client::ControllerClient;
use drift::ctrl::server::{ControllerHandle, ControllerServer};
use drift::sync::condvar::CondVar;
use drift::sync::mutex::Mutex;
use drift::{
    register_method, register_type, Evicted, MethodRef, ProcletId, RemPtr, Runtime, RuntimeMode,
    Time,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Fixture proclet types.

#[derive(Serialize, Deserialize)]
struct VecStore {
    data: Mutex<Vec<u64>>,
}

fn vec_sum(s: &VecStore, _: ()) -> Result<u64, Evicted> {
    Ok(s.data.lock()?.iter().sum())
}

fn vec_get(s: &VecStore, _: ()) -> Result<Vec<u64>, Evicted> {
    Ok(s.data.lock()?.clone())
}

fn vec_push(s: &VecStore, batch: Vec<u64>) -> Result<u64, Evicted> {
    let mut data = s.data.lock()?;
    data.extend(batch);
    Ok(data.len() as u64)
}

fn vec_seal_sorted(s: &VecStore, _: ()) -> Result<Vec<u64>, Evicted> {
    let mut data = s.data.lock()?;
    data.sort_unstable();
    Ok(data.clone())
}

#[derive(Serialize, Deserialize)]
struct Combiner;

/// Elementwise sum of two other proclets' vectors, fetched over two nested
/// calls.
fn combiner_add(
    _c: &Combiner,
    (a, b): (RemPtr<VecStore>, RemPtr<VecStore>),
) -> Result<Vec<u64>, Evicted> {
    let f = fixtures();
    let xs = a.run(&f.vec_get, ());
    let ys = b.run(&f.vec_get, ());
    Ok(xs.iter().zip(ys.iter()).map(|(x, y)| x + y).collect())
}

#[derive(Serialize, Deserialize)]
struct Spinner;

/// Burns roughly a millisecond of CPU, then echoes a transform of its
/// argument.
fn spinner_spin(_s: &Spinner, arg: u64) -> Result<u64, Evicted> {
    Time::delay(1000);
    Ok(arg * 2 + 1)
}

fn spinner_nap(_s: &Spinner, us: u64) -> Result<u64, Evicted> {
    let before = Time::microtime();
    Time::sleep(us)?;
    Ok(Time::microtime() - before)
}

#[derive(Serialize, Deserialize)]
struct CreditPool {
    credit: Mutex<u64>,
    cv: CondVar,
}

fn pool_consume(p: &CreditPool, _: ()) -> Result<(), Evicted> {
    let mut credit = p.credit.lock()?;
    while *credit == 0 {
        credit = p.cv.wait(credit)?;
    }
    *credit -= 1;
    Ok(())
}

fn pool_produce(p: &CreditPool, _: ()) -> Result<(), Evicted> {
    *p.credit.lock()? += 1;
    p.cv.notify_one();
    Ok(())
}

fn pool_read(p: &CreditPool, _: ()) -> Result<u64, Evicted> {
    Ok(*p.credit.lock()?)
}

struct Fixtures {
    vec_sum: MethodRef<VecStore, (), u64>,
    vec_get: MethodRef<VecStore, (), Vec<u64>>,
    vec_push: MethodRef<VecStore, Vec<u64>, u64>,
    vec_seal_sorted: MethodRef<VecStore, (), Vec<u64>>,
    combiner_add: MethodRef<Combiner, (RemPtr<VecStore>, RemPtr<VecStore>), Vec<u64>>,
    spinner_spin: MethodRef<Spinner, u64, u64>,
    spinner_nap: MethodRef<Spinner, u64, u64>,
    pool_consume: MethodRef<CreditPool, (), ()>,
    pool_produce: MethodRef<CreditPool, (), ()>,
    pool_read: MethodRef<CreditPool, (), u64>,
}

fn fixtures() -> &'static Fixtures {
    lazy_static! {
        static ref FIXTURES: Fixtures = {
            register_type::<VecStore>("test.vec");
            register_type::<Combiner>("test.combiner");
            register_type::<Spinner>("test.spinner");
            register_type::<CreditPool>("test.pool");
            Fixtures {
                vec_sum: register_method("test.vec.sum", vec_sum),
                vec_get: register_method("test.vec.get", vec_get),
                vec_push: register_method("test.vec.push", vec_push),
                vec_seal_sorted: register_method("test.vec.seal_sorted", vec_seal_sorted),
                combiner_add: register_method("test.combiner.add", combiner_add),
                spinner_spin: register_method("test.spinner.spin", spinner_spin),
                spinner_nap: register_method("test.spinner.nap", spinner_nap),
                pool_consume: register_method("test.pool.consume", pool_consume),
                pool_produce: register_method("test.pool.produce", pool_produce),
                pool_read: register_method("test.pool.read", pool_read),
            }
        };
    }
    &FIXTURES
}

// ---------------------------------------------------------------------------
// In-process cluster fixture. Heap windows and stack clusters come out of
// the same cluster-wide VA layout, so tests serialize on one lock.

lazy_static! {
    static ref CLUSTER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

struct Cluster {
    nodes: Vec<Arc<Runtime>>,
    ctrl: Option<ControllerHandle>,
    ctrl_client: ControllerClient,
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl Cluster {
    fn start(num_nodes: usize) -> Cluster {
        let guard = CLUSTER_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = env_logger::builder().is_test(true).try_init();
        fixtures();

        let server = ControllerServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let handle = server.spawn();
        let ctrl_client = ControllerClient::new(handle.addr);

        let mut nodes = Vec::new();
        let mut lpid = 0;
        for i in 0..num_nodes {
            let cfg = Config {
                controller: handle.addr.to_string(),
                rpc_port: 0,
                migrator_port: 0,
                host: HostSchedConfig::default(),
                pressure_shm: None,
            };
            let ip = Ipv4Addr::new(127, 0, 0, (i + 1) as u8);
            let rt = Runtime::init(&cfg, RuntimeMode::Server, lpid, ip).unwrap();
            lpid = rt.lpid();
            nodes.push(rt);
        }
        Cluster {
            nodes,
            ctrl: Some(handle),
            ctrl_client,
            _guard: guard,
        }
    }

    fn node_ip(&self, i: usize) -> u32 {
        self.nodes[i].self_ip()
    }

    fn resolve_ip(&self, id: ProcletId) -> Option<u32> {
        self.ctrl_client.resolve_proclet(id).unwrap().map(|a| a.ip)
    }

    fn wait_until<F: FnMut() -> bool>(&self, what: &str, timeout: Duration, mut f: F) {
        let deadline = Instant::now() + timeout;
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for rt in &self.nodes {
            rt.shutdown();
        }
        if let Some(mut ctrl) = self.ctrl.take() {
            ctrl.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------

#[test]
fn pass_by_value_round_trip() {
    let cluster = Cluster::start(1);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();

    let p = rt
        .make_proclet(&VecStore {
            data: Mutex::new(vec![1, 2, 3]),
        })
        .expect("make_proclet");
    let id = p.id();
    assert_eq!(p.run(&f.vec_sum, ()), 6);

    drop(p);
    assert_eq!(
        cluster.resolve_ip(id),
        None,
        "directory must be empty after destroy"
    );
}

#[test]
fn cross_proclet_elementwise_add() {
    let cluster = Cluster::start(2);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();

    let a = rt
        .make_proclet(&VecStore {
            data: Mutex::new(vec![1, 2, 3, 4]),
        })
        .unwrap();
    let b = rt
        .make_proclet(&VecStore {
            data: Mutex::new(vec![5, 6, 7, 8]),
        })
        .unwrap();
    let c = rt.make_proclet(&Combiner).unwrap();

    let sums = c.run(&f.combiner_add, (a.weak(), b.weak()));
    assert_eq!(sums, vec![6, 8, 10, 12]);
}

#[test]
fn in_proclet_sleep_uses_logical_time() {
    let cluster = Cluster::start(1);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();

    let s = rt.make_proclet(&Spinner).unwrap();
    let slept = s.run(&f.spinner_nap, 10_000);
    assert!(slept >= 10_000, "logical sleep too short: {}us", slept);
}

#[test]
fn migration_under_cpu_pressure_loses_no_replies() {
    let cluster = Cluster::start(2);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();
    let node1_ip = cluster.node_ip(0);
    let node2_ip = cluster.node_ip(1);

    // All proclets start on node 1.
    let mut proclets = Vec::new();
    for _ in 0..8 {
        proclets.push(
            rt.make_proclet_opts(&Spinner, true, Some(node1_ip))
                .expect("make_proclet"),
        );
    }
    let ids: Vec<ProcletId> = proclets.iter().map(|p| p.id()).collect();

    // Fan out calls, raise pressure mid-run, keep calling.
    let mut futures = Vec::new();
    for round in 0..10u64 {
        for (i, p) in proclets.iter().enumerate() {
            let arg = round * 100 + i as u64;
            futures.push((arg, p.run_async(&f.spinner_spin, arg)));
        }
        if round == 4 {
            cluster.nodes[0]
                .pressure_handler()
                .unwrap()
                .mock_set_pressure(true);
        }
    }

    for (arg, fut) in futures {
        assert_eq!(fut.get(), arg * 2 + 1, "reply lost or wrong for {}", arg);
    }

    cluster.wait_until("pressure ack", Duration::from_secs(10), || {
        cluster.nodes[0].pressure_handler().unwrap().is_handled()
    });
    cluster.wait_until("some proclet on node 2", Duration::from_secs(10), || {
        ids.iter().any(|id| cluster.resolve_ip(*id) == Some(node2_ip))
    });
}

#[test]
fn parked_waiters_survive_migration() {
    let cluster = Cluster::start(2);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();
    let node1_ip = cluster.node_ip(0);
    let node2_ip = cluster.node_ip(1);

    let pool = rt
        .make_proclet_opts(
            &CreditPool {
                credit: Mutex::new(0),
                cv: CondVar::new(),
            },
            true,
            Some(node1_ip),
        )
        .expect("make_proclet");
    let id = pool.id();

    const N: usize = 16;
    let mut consumers = Vec::new();
    for _ in 0..N {
        consumers.push(pool.run_async(&f.pool_consume, ()));
    }
    // Let the consumers reach their condvar parks.
    std::thread::sleep(Duration::from_millis(300));

    // Move the pool while every consumer is parked.
    cluster.nodes[0]
        .pressure_handler()
        .unwrap()
        .mock_set_pressure(false);
    cluster.wait_until("pool on node 2", Duration::from_secs(10), || {
        cluster.resolve_ip(id) == Some(node2_ip)
    });

    for _ in 0..N {
        pool.run(&f.pool_produce, ());
    }
    for fut in consumers {
        fut.get();
    }
    assert_eq!(pool.run(&f.pool_read, ()), 0, "every credit consumed once");
}

#[test]
fn stale_directory_cache_recovers_via_forwarding() {
    let cluster = Cluster::start(2);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();
    let node1_ip = cluster.node_ip(0);
    let node2_ip = cluster.node_ip(1);

    let p = rt
        .make_proclet_opts(
            &VecStore {
                data: Mutex::new(vec![1, 2, 3]),
            },
            true,
            Some(node1_ip),
        )
        .expect("make_proclet");
    let id = p.id();
    // Prime the caller's address cache.
    assert_eq!(p.run(&f.vec_sum, ()), 6);

    cluster.nodes[0]
        .pressure_handler()
        .unwrap()
        .mock_set_pressure(false);
    cluster.wait_until("proclet on node 2", Duration::from_secs(10), || {
        cluster.resolve_ip(id) == Some(node2_ip)
    });

    // The cached address now points at the old owner; the call must chase
    // the FORWARDED response and still return the right answer.
    assert_eq!(p.run(&f.vec_sum, ()), 6);
}

#[test]
fn pressure_with_no_candidates_is_acknowledged() {
    let cluster = Cluster::start(2);
    let ph = cluster.nodes[0].pressure_handler().unwrap();
    ph.mock_set_pressure(true);
    cluster.wait_until("ack with empty node", Duration::from_secs(5), || {
        ph.is_handled()
    });
}

#[test]
fn sharded_sorter_over_proclets() {
    use rand::{Rng, SeedableRng};

    let cluster = Cluster::start(2);
    let rt = Arc::clone(&cluster.nodes[0]);
    let _g = rt.enter();
    let f = fixtures();

    const NUM_SHARDS: u64 = 4;
    const N: usize = 40_000;
    let shard_width = u64::MAX / NUM_SHARDS + 1;

    let shards: Vec<_> = (0..NUM_SHARDS)
        .map(|_| {
            rt.make_proclet(&VecStore {
                data: Mutex::new(Vec::new()),
            })
            .expect("make shard")
        })
        .collect();

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut batches: Vec<Vec<u64>> = vec![Vec::new(); NUM_SHARDS as usize];
    for _ in 0..N {
        let key: u64 = rng.gen();
        batches[(key / shard_width) as usize].push(key);
    }
    for (shard, batch) in shards.iter().zip(batches.iter()) {
        for chunk in batch.chunks(1024) {
            shard.run(&f.vec_push, chunk.to_vec());
        }
    }

    let mut total = 0;
    let mut last: Option<u64> = None;
    for shard in &shards {
        let sorted = shard.run(&f.vec_seal_sorted, ());
        for key in sorted {
            if let Some(prev) = last {
                assert!(prev <= key, "out of order: {} then {}", prev, key);
            }
            last = Some(key);
            total += 1;
        }
    }
    assert_eq!(total, N);
}
