use crate::commons::{ProcletId, Resource};
use crate::ctrl::{read_msg, write_msg};
use crate::proclet::{ProcletHeader, ProcletStatus};
use crate::registry;
use crate::runtime::Runtime;
use crate::sync::time::ProcletClock;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Everything the destination needs to install one proclet: identity,
/// refcount, serialized root state, the logical clock, and the wait-point
/// tables captured at quiesce time. Pointer stability comes from the
/// destination mapping the same VA window and re-placing the root at the
/// recorded address.
#[derive(Serialize, Deserialize)]
struct MigrationMsg {
    proclet_id: ProcletId,
    type_sel: u64,
    migratable: bool,
    ref_cnt: i64,
    /// Threads that drained during quiesce; diagnostic only.
    drained_threads: u32,
    /// Wait points that existed at quiesce. Their waiter lists rebuild as
    /// the evicted calls re-issue here, so the table is carried for
    /// observability and sanity checks rather than replay.
    blocked_syncers: Vec<(u64, u8)>,
    timer_count: u32,
    logical_us: u64,
    root_addr: u64,
    heap_used_bytes: u64,
    state: Vec<u8>,
}

const ACK_OK: u8 = 0;

/// Orchestrates live migration of local proclets. The quiesce protocol:
/// flip the directory status so new calls bounce with CLIENT_RETRY, raise
/// the header's migrating flag, wake evictable parked threads, then
/// writer-sync the proclet RCU so every remaining dispatch drains.
pub struct Migrator;

impl Migrator {
    pub fn new() -> Migrator {
        Migrator
    }

    /// Migrates the batch picked by the pressure handler; `target` is the
    /// relief the batch was sized for and is logged against the outcome.
    pub fn migrate(&self, rt: &Arc<Runtime>, target: Resource, tasks: &[ProcletId]) -> usize {
        let mut moved = 0;
        let mut relieved = Resource::default();
        for id in tasks {
            if let Some(freed) = self.migrate_one(rt, *id) {
                moved += 1;
                relieved.mem_mbs += freed.mem_mbs;
                relieved.cores += freed.cores;
            }
        }
        if moved > 0 {
            debug!(
                "migrated {}/{} proclets, relieved ~{} MB (target {} MB)",
                moved,
                tasks.len(),
                relieved.mem_mbs,
                target.mem_mbs
            );
        }
        moved
    }

    /// Runs the full protocol for one proclet. Returns the resources the
    /// move relieved, or None if the proclet was skipped (already
    /// migrating, pinned, destroyed, or no destination).
    fn migrate_one(&self, rt: &Arc<Runtime>, id: ProcletId) -> Option<Resource> {
        let mgr = rt.proclets();
        let entry = mgr.get(id)?;

        // The CAS is what makes us the only migrator (and blocks
        // the destruction path) for this proclet.
        if !entry.cas_status(ProcletStatus::Present, ProcletStatus::Migrating) {
            return None;
        }
        let header = unsafe { entry.header() };
        if !header.migratable() {
            entry.set_status(ProcletStatus::Present);
            return None;
        }

        let resource = Resource {
            cores: header.cpu_load.load().ceil() as u32,
            mem_mbs: (header.mem_size() >> 20) as u32,
        };

        // Pick a destination.
        let dest = match rt.ctrl().get_migration_dest(rt.lpid(), rt.self_ip(), resource) {
            Ok(Some(dest)) => dest,
            _ => {
                entry.set_status(ProcletStatus::Present);
                return None;
            }
        };

        info!("migrating {} to {}", id, dest.rpc_addr());

        // Quiesce. The forward address goes up first so threads that
        // unwind with Evicted can answer their callers with the new owner.
        entry.set_forward(dest.rpc_addr());
        header.set_migrating(true);
        let blocked_syncers: Vec<(u64, u8)> = header
            .blocked_syncer
            .snapshot()
            .into_iter()
            .map(|(addr, kind)| (addr, kind as u8))
            .collect();
        let timer_count = header.clock.num_pending_timers() as u32;
        let evicted = header.evict_parked_threads();
        header.rcu.writer_sync(true);
        debug!(
            "{} quiesced: {} evicted, {} wait points, {} timers",
            id,
            evicted,
            blocked_syncers.len(),
            timer_count
        );

        // Announce and stream state to the destination.
        let state = match registry::serialize_root(header.type_sel(), header.root()) {
            Some(state) => state,
            None => bug!("cannot serialize root of {}", id),
        };
        let msg = MigrationMsg {
            proclet_id: id,
            type_sel: header.type_sel(),
            migratable: header.migratable(),
            ref_cnt: header.ref_cnt(),
            drained_threads: header.thread_cnt(),
            blocked_syncers,
            timer_count,
            logical_us: header.clock.logical_now_us(),
            root_addr: header.root(),
            heap_used_bytes: header.slab.usage(),
            state,
        };

        // From the first transferred byte on, failure is unrecoverable:
        // partial state exists on both sides. TODO: a fail-back-to-source
        // path would need the source to keep its copy until the ack.
        let conns = rt.migrator_conns();
        let mut conn = match conns.get(&dest.migrator_addr()) {
            Ok(conn) => conn,
            Err(err) => bug!("no migration channel to {}: {}", dest.migrator_addr(), err),
        };
        if let Err(err) = write_msg(&mut conn, &msg) {
            bug!("migration transfer of {} failed: {}", id, err);
        }
        let ack: u8 = match read_msg(&mut conn) {
            Ok(ack) => ack,
            Err(err) => bug!("migration ack for {} failed: {}", id, err),
        };
        bug_on!(ack != ACK_OK, "destination refused {}", id);
        conns.put(&dest.migrator_addr(), conn);

        // Cutover: directory first, then reclaim the local window.
        if let Err(err) = rt.ctrl().update_location(id, dest.rpc_addr()) {
            bug!("cutover of {} failed: {}", id, err);
        }
        rt.caller().learn_location(id, dest.rpc_addr());
        entry.set_status(ProcletStatus::Absent);
        mgr.rcu.writer_sync(false);
        // Root state now lives at the destination; the local drop only
        // releases memory (serializable state owns nothing else).
        registry::destruct_root(header.type_sel(), &header.slab, header.root());
        unsafe { mgr.unmap_window(id) };
        info!("{} now lives at {}", id, dest.rpc_addr());
        Some(resource)
    }
}

impl Default for Migrator {
    fn default() -> Migrator {
        Migrator::new()
    }
}

/// Destination side: accept loop for migration-protocol connections.
pub(crate) fn spawn_loader_loop(
    rt: Arc<Runtime>,
    listener: TcpListener,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("drift-migra-ldr".into())
        .spawn(move || {
            info!("migration loader listening on {}", rt.migrator_addr());
            loop {
                if rt.is_done() {
                    return;
                }
                match listener.accept() {
                    Ok((conn, _)) => {
                        conn.set_nonblocking(false).ok();
                        conn.set_nodelay(true).ok();
                        let rt = Arc::clone(&rt);
                        std::thread::Builder::new()
                            .name("drift-migra-conn".into())
                            .spawn(move || loader_conn(rt, conn))
                            .ok();
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        debug!("loader accept error: {}", e);
                        return;
                    }
                }
            }
        })
        .expect("spawn migration loader")
}

fn loader_conn(rt: Arc<Runtime>, mut conn: TcpStream) {
    loop {
        let msg: MigrationMsg = match read_msg(&mut conn) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        install(&rt, msg);
        if write_msg(&mut conn, &ACK_OK).is_err() {
            return;
        }
    }
}

/// Installs an incoming proclet: map the same window, rebuild the header
/// with the carried clock, re-place the root at the recorded address,
/// publish PRESENT. Waiter lists start empty; the evicted calls re-park as
/// they are re-issued against this node.
fn install(rt: &Arc<Runtime>, msg: MigrationMsg) {
    let id = msg.proclet_id;
    let mgr = rt.proclets();
    let entry = mgr.entry_or_insert(id);
    bug_on!(
        entry.status() != ProcletStatus::Absent,
        "incoming migration for non-absent {}",
        id
    );
    entry.clear_forward();

    let base = match mgr.map_window(id) {
        Ok(base) => base,
        Err(err) => bug!("cannot map incoming window for {}: {}", id, err),
    };
    let header: &ProcletHeader = unsafe {
        ProcletHeader::init_at(
            base,
            msg.type_sel,
            msg.migratable,
            ProcletClock::continuing_from(msg.logical_us),
        )
    };
    let root = match registry::construct_root(msg.type_sel, &header.slab, &msg.state) {
        Some(root) => root,
        None => bug!("unregistered type {:#x} in migration of {}", msg.type_sel, id),
    };
    bug_on!(
        root != msg.root_addr,
        "root moved across migration of {}: {:#x} != {:#x}",
        id,
        root,
        msg.root_addr
    );
    header.set_root(root);
    header.ref_cnt_add(msg.ref_cnt);

    if !msg.blocked_syncers.is_empty() || msg.timer_count > 0 {
        debug!(
            "{} arrives with {} wait points and {} timers to re-establish",
            id,
            msg.blocked_syncers.len(),
            msg.timer_count
        );
    }

    entry.set_status(ProcletStatus::Present);
    info!(
        "installed {} ({} state bytes, {} drained threads at source)",
        id,
        msg.state.len(),
        msg.drained_threads
    );
}
