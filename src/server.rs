use crate::commons::{rdtsc, NodeAddr, ProcletId};
use crate::proclet::{ProcletEntry, ProcletStatus};
use crate::registry;
use crate::rpc::{
    encode_forward_addr, encode_response, ProcletRequest, ReqHdr, RespHdr, CMD_CALL,
    INITIAL_CREDITS, RPC_HDR_SIZE,
};
use crate::runtime::{CtxGuard, DispatchCtx, Runtime};
use crate::slab::SlabBuf;
use crate::sync::time::ProcletClock;
use crate::uthread::{ThreadEntry, UThread};
use log::{debug, info};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Server side of the proclet protocol: accepts connections, demultiplexes
/// `construct / destruct / refcount / invoke` onto the named proclet, and
/// runs each request on a fresh dispatch thread drawn from the per-lpid
/// stack cluster.
pub(crate) fn spawn_accept_loop(
    rt: Arc<Runtime>,
    listener: TcpListener,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("drift-proclet-srv".into())
        .spawn(move || {
            info!("proclet server listening on {}", rt.rpc_addr());
            loop {
                if rt.is_done() {
                    return;
                }
                match listener.accept() {
                    Ok((conn, _peer)) => {
                        conn.set_nonblocking(false).ok();
                        conn.set_nodelay(true).ok();
                        let rt = Arc::clone(&rt);
                        std::thread::Builder::new()
                            .name("drift-rpc-conn".into())
                            .spawn(move || handle_conn(rt, conn))
                            .ok();
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        debug!("proclet server accept error: {}", e);
                        return;
                    }
                }
            }
        })
        .expect("spawn proclet server")
}

/// Shared write side of one client connection. Responses from concurrent
/// dispatch threads serialize through the writer lock; `inflight` feeds the
/// credit grant on each response.
struct ConnShared {
    writer: Mutex<TcpStream>,
    inflight: AtomicU32,
}

impl ConnShared {
    fn send_response(&self, token: u64, payload: &[u8]) {
        let inflight = self.inflight.fetch_sub(1, Ordering::AcqRel) - 1;
        let credits = INITIAL_CREDITS.saturating_sub(inflight).max(1);
        let hdr = RespHdr {
            cmd: CMD_CALL,
            credits,
            payload_len: payload.len() as u64,
            token,
        };
        let mut writer = self.writer.lock().unwrap();
        let _ = writer
            .write_all(&hdr.encode())
            .and_then(|_| writer.write_all(payload));
    }
}

fn handle_conn(rt: Arc<Runtime>, mut conn: TcpStream) {
    let shared = Arc::new(ConnShared {
        writer: Mutex::new(match conn.try_clone() {
            Ok(w) => w,
            Err(_) => return,
        }),
        inflight: AtomicU32::new(0),
    });

    loop {
        let mut hdr_buf = [0u8; RPC_HDR_SIZE];
        if conn.read_exact(&mut hdr_buf).is_err() {
            return;
        }
        let hdr = ReqHdr::decode(&hdr_buf);
        bug_on!(hdr.cmd != CMD_CALL, "unknown rpc cmd {:#x}", hdr.cmd);

        // Payload scratch comes from the runtime heap, not the process
        // allocator.
        let mut payload =
            match SlabBuf::alloc(crate::runtime::runtime_heap(), hdr.payload_len as usize) {
                Some(buf) => buf,
                None => bug!("runtime heap exhausted reading a request"),
            };
        if conn.read_exact(&mut payload).is_err() {
            return;
        }

        shared.inflight.fetch_add(1, Ordering::AcqRel);
        let rt2 = Arc::clone(&rt);
        let shared2 = Arc::clone(&shared);
        let token = hdr.token;
        let stack = rt.stacks().get();
        let spawned = UThread::spawn(stack, move || {
            dispatch(rt2, shared2, token, payload);
        });
        match spawned {
            Ok(uth) => rt.reaper().retire(uth),
            Err(err) => {
                rt.stacks().put(stack);
                debug!("failed to spawn dispatch thread: {}", err);
                shared.send_response(token, &encode_response(crate::rpc::RC_CLIENT_RETRY, &[]));
            }
        }
    }
}

fn dispatch(rt: Arc<Runtime>, conn: Arc<ConnShared>, token: u64, payload: SlabBuf) {
    let req = match ProcletRequest::decode(&payload) {
        Some(req) => req,
        None => bug!("malformed proclet request"),
    };
    let resp = match req {
        ProcletRequest::Invoke { id, selector, args } => invoke(&rt, id, selector, args),
        ProcletRequest::Construct {
            id,
            type_sel,
            migratable,
            state,
        } => construct(&rt, id, type_sel, migratable, state),
        ProcletRequest::UpdateRefCnt { id, delta } => update_ref_cnt(&rt, id, delta),
        ProcletRequest::Destruct { id } => update_ref_cnt(&rt, id, -1),
    };
    conn.send_response(token, &resp);
}

/// Answer for a proclet this node no longer (or never) hosts: the
/// forwarding address if the proclet migrated away from here, else the null
/// address, which makes the caller re-resolve through the controller.
fn forwarded(entry: Option<&Arc<ProcletEntry>>) -> Vec<u8> {
    let addr = entry
        .and_then(|e| e.forward())
        .unwrap_or(NodeAddr::NONE);
    encode_response(crate::rpc::RC_FORWARDED, &encode_forward_addr(addr))
}

fn client_retry() -> Vec<u8> {
    encode_response(crate::rpc::RC_CLIENT_RETRY, &[])
}

fn ok(payload: &[u8]) -> Vec<u8> {
    encode_response(crate::rpc::RC_OK, payload)
}

fn invoke(rt: &Arc<Runtime>, id: ProcletId, selector: u64, args: &[u8]) -> Vec<u8> {
    let mgr = rt.proclets();
    let dir = mgr.rcu.read();
    let entry = match mgr.get(id) {
        Some(entry) => entry,
        None => return forwarded(None),
    };
    match entry.status() {
        ProcletStatus::Absent => return forwarded(Some(&entry)),
        ProcletStatus::Migrating => return client_retry(),
        ProcletStatus::Present => {}
    }

    let header = unsafe { entry.header() };
    header.rcu.reader_lock();
    // From here the proclet's own RCU keeps the window mapped (both the
    // destruction path and migration cutover writer-sync it before
    // unmapping), so the directory lock can go; holding it across a long
    // method would stall node-wide teardown.
    drop(dir);
    // The status may have flipped between the check above and the reader
    // lock; a post-lock recheck makes the quiesce race benign.
    if entry.status() != ProcletStatus::Present || header.is_migrating() {
        header.rcu.reader_unlock();
        return client_retry();
    }

    let tentry = ThreadEntry::new();
    header.attach_thread(&tentry);
    let _ctx = CtxGuard::install(DispatchCtx {
        runtime: Arc::clone(rt),
        header: id.0,
        entry: Arc::clone(&tentry),
    });

    let start = rdtsc();
    let result = registry::invoke(selector, header.root(), args);
    header.cpu_load.charge(rdtsc().saturating_sub(start));

    header.detach_thread(&tentry);
    header.rcu.reader_unlock();

    match result {
        None => bug!("unknown selector {:#x} for {}", selector, id),
        Some(Err(err)) => bug!("argument decode failed for {}: {}", id, err),
        Some(Ok(Ok(bytes))) => ok(&bytes),
        Some(Ok(Err(_evicted))) => forwarded(Some(&entry)),
    }
}

fn construct(
    rt: &Arc<Runtime>,
    id: ProcletId,
    type_sel: u64,
    migratable: bool,
    state: &[u8],
) -> Vec<u8> {
    let mgr = rt.proclets();
    let entry = mgr.entry_or_insert(id);
    bug_on!(
        entry.status() != ProcletStatus::Absent,
        "construct for already present {}",
        id
    );
    entry.clear_forward();
    let base = match mgr.map_window(id) {
        Ok(base) => base,
        Err(err) => {
            debug!("cannot map window for {}: {}", id, err);
            return client_retry();
        }
    };
    let header =
        unsafe { crate::proclet::ProcletHeader::init_at(base, type_sel, migratable, ProcletClock::new()) };
    let root = match registry::construct_root(type_sel, &header.slab, state) {
        Some(root) => root,
        None => bug!("unregistered root type {:#x} constructing {}", type_sel, id),
    };
    header.set_root(root);
    header.ref_cnt_add(1);
    // Publish only after the header and root are fully initialized.
    entry.set_status(ProcletStatus::Present);
    debug!("constructed {} (root {:#x})", id, root);
    ok(&root.to_le_bytes())
}

fn update_ref_cnt(rt: &Arc<Runtime>, id: ProcletId, delta: i64) -> Vec<u8> {
    let mgr = rt.proclets();
    let dir = mgr.rcu.read();
    let entry = match mgr.get(id) {
        Some(entry) => entry,
        None => return forwarded(None),
    };
    match entry.status() {
        ProcletStatus::Absent => return forwarded(Some(&entry)),
        ProcletStatus::Migrating => return client_retry(),
        ProcletStatus::Present => {}
    }

    let header = unsafe { entry.header() };
    let new_cnt = header.ref_cnt_add(delta);
    if new_cnt != 0 {
        return ok(&[]);
    }

    // Zero transition: take the proclet out of service. The CAS loses to a
    // concurrent migration, in which case the delta is rolled back and the
    // caller retries against the new owner.
    if !entry.cas_status(ProcletStatus::Present, ProcletStatus::Absent) {
        header.ref_cnt_add(-delta);
        return client_retry();
    }

    // The CAS makes this thread the sole destroyer; the directory guard
    // must drop before the writer syncs inside destroy_local.
    drop(dir);
    destroy_local(rt, &entry);
    ok(&[])
}

/// Tears down a proclet this node owns, after its entry has left `Present`.
pub(crate) fn destroy_local(rt: &Arc<Runtime>, entry: &Arc<ProcletEntry>) {
    let mgr = rt.proclets();
    let id = entry.id;
    // Wait out lookups that raced the status change, then in-flight
    // dispatches.
    mgr.rcu.writer_sync(false);
    let header = unsafe { entry.header() };
    header.rcu.writer_sync(false);

    registry::destruct_root(header.type_sel(), &header.slab, header.root());
    unsafe { mgr.unmap_window(id) };
    rt.caller().forget_location(id);
    if let Err(err) = rt.ctrl().destroy_proclet(id) {
        debug!("controller destroy for {} failed: {}", id, err);
    }
    info!("destroyed {}", id);
}
