use crate::commons::{Lpid, NodeAddr, RUNTIME_HEAP_SIZE, RUNTIME_HEAP_VADDR};
use crate::config::Config;
use crate::ctrl::client::ControllerClient;
use crate::ctrl::NodeSpec;
use crate::error::{Error, Result};
use crate::migrator::Migrator;
use crate::monitor::Monitor;
use crate::pressure::PressureHandler;
use crate::proclet::{ProcletHeader, ProcletManager};
use crate::registry;
use crate::rem::RemUniquePtr;
use crate::rpc::client::ProcletCaller;
use crate::rpc::conn_mgr::ConnectionManager;
use crate::rpc::ProcletRequest;
use crate::server;
use crate::slab::SlabAllocator;
use crate::stack::StackAllocator;
use crate::sync::SpinLock;
use crate::uthread::{Reaper, ThreadEntry};
use log::info;
use std::cell::RefCell;
use std::convert::TryInto;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide runtime heap: one fixed VA window per process, holding
/// internal scratch (request payload buffers and the like). It is not
/// cluster-unique and never migrates.
pub fn runtime_heap() -> &'static SlabAllocator {
    lazy_static! {
        static ref HEAP: &'static SlabAllocator = {
            let base = crate::commons::mmap_fixed(RUNTIME_HEAP_VADDR, RUNTIME_HEAP_SIZE)
                .expect("map runtime heap");
            let slab = unsafe { SlabAllocator::new(0xBE, base, RUNTIME_HEAP_SIZE as usize) };
            Box::leak(Box::new(slab))
        };
    }
    *HEAP
}

/// Execution context of a dispatch thread: which runtime spawned it, which
/// proclet it is inside, and its thread-set entry. Set for the span of one
/// method invocation.
#[derive(Clone)]
pub struct DispatchCtx {
    pub runtime: Arc<Runtime>,
    pub(crate) header: u64,
    pub entry: Arc<ThreadEntry>,
}

impl DispatchCtx {
    pub fn header(&self) -> &'static ProcletHeader {
        unsafe { &*(self.header as *const ProcletHeader) }
    }
}

thread_local! {
    static TLS_CTX: RefCell<Option<DispatchCtx>> = RefCell::new(None);
    static TLS_AMBIENT: RefCell<Option<Arc<Runtime>>> = RefCell::new(None);
}

lazy_static! {
    static ref DEFAULT_RUNTIME: SpinLock<Option<Arc<Runtime>>> = SpinLock::new(None);
}

pub fn dispatch_ctx() -> Option<DispatchCtx> {
    TLS_CTX.with(|c| c.borrow().clone())
}

pub fn current_header() -> Option<&'static ProcletHeader> {
    TLS_CTX.with(|c| c.borrow().as_ref().map(|ctx| ctx.header()))
}

/// The runtime calls on this thread go through: the dispatch context's
/// runtime inside a proclet, a thread-scoped override, or the process
/// default.
pub fn current() -> Arc<Runtime> {
    try_current().expect("no runtime initialized on this process")
}

pub fn try_current() -> Option<Arc<Runtime>> {
    if let Some(ctx) = dispatch_ctx() {
        return Some(ctx.runtime);
    }
    if let Some(rt) = TLS_AMBIENT.with(|c| c.borrow().clone()) {
        return Some(rt);
    }
    DEFAULT_RUNTIME.lock().clone()
}

/// RAII context installer used by the proclet server for the span of a
/// dispatch.
pub(crate) struct CtxGuard;

impl CtxGuard {
    pub fn install(ctx: DispatchCtx) -> CtxGuard {
        TLS_CTX.with(|c| *c.borrow_mut() = Some(ctx));
        CtxGuard
    }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        TLS_CTX.with(|c| *c.borrow_mut() = None);
    }
}

/// Thread-scoped ambient-runtime override, for programs driving more than
/// one runtime (in-process cluster tests).
pub struct AmbientGuard {
    prev: Option<Arc<Runtime>>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        TLS_AMBIENT.with(|c| *c.borrow_mut() = prev);
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RuntimeMode {
    /// Hosts proclets: proclet server, migrator, pressure handler.
    Server,
    /// Creates and calls proclets but hosts none.
    Client,
}

/// Process-wide anchor wiring the subsystems together. Init order is
/// fixed: slab, proclet manager, controller client, RPC manager, proclet
/// server, migrator, pressure handler. Tear-down runs in reverse, each
/// component observing a done flag at its yield points.
pub struct Runtime {
    mode: RuntimeMode,
    lpid: Lpid,
    self_ip: u32,
    rpc_addr: NodeAddr,
    migrator_addr: NodeAddr,
    proclets: ProcletManager,
    stacks: Option<Arc<StackAllocator>>,
    reaper: Option<Reaper>,
    ctrl: Arc<ControllerClient>,
    caller: ProcletCaller,
    /// Pre-opened migration-protocol connections, reserved toward every
    /// lpid peer at registration.
    migrator_conns: ConnectionManager<NodeAddr, TcpStream>,
    migrator: Migrator,
    pressure: SpinLock<Option<PressureHandler>>,
    monitor: SpinLock<Option<Monitor>>,
    service_threads: SpinLock<Vec<std::thread::JoinHandle<()>>>,
    done: Arc<AtomicBool>,
}

impl Runtime {
    /// Boots a runtime instance against the controller named in `cfg`.
    /// `lpid_hint` of zero asks for a fresh logical process (server mode
    /// only); clients must name the lpid they join.
    pub fn init(
        cfg: &Config,
        mode: RuntimeMode,
        lpid_hint: Lpid,
        self_ip: Ipv4Addr,
    ) -> Result<Arc<Runtime>> {
        runtime_heap();
        let ctrl_addr = cfg.controller_addr()?;
        let ctrl = Arc::new(ControllerClient::new(ctrl_addr));
        let self_ip = u32::from(self_ip);
        let done = Arc::new(AtomicBool::new(false));

        let (rpc_listener, migrator_listener) = match mode {
            RuntimeMode::Server => {
                let rpc = bind_listener(cfg.rpc_port)?;
                let migra = bind_listener(cfg.migrator_port)?;
                (Some(rpc), Some(migra))
            }
            RuntimeMode::Client => (None, None),
        };
        let rpc_addr = NodeAddr {
            ip: self_ip,
            port: rpc_listener
                .as_ref()
                .map(|l| l.local_addr().unwrap().port())
                .unwrap_or(0),
        };
        let migrator_addr = NodeAddr {
            ip: self_ip,
            port: migrator_listener
                .as_ref()
                .map(|l| l.local_addr().unwrap().port())
                .unwrap_or(0),
        };

        let migrator_conns: ConnectionManager<NodeAddr, TcpStream> =
            ConnectionManager::new(2, |addr: &NodeAddr| {
                let conn = TcpStream::connect(addr.to_socket_addr())?;
                conn.set_nodelay(true)?;
                Ok(conn)
            });

        let (lpid, stacks, reaper) = match mode {
            RuntimeMode::Server => {
                let info = ctrl.register_node(
                    NodeSpec {
                        ip: self_ip,
                        rpc_port: rpc_addr.port,
                        migrator_port: migrator_addr.port,
                    },
                    lpid_hint,
                    registry::fingerprint(),
                )?;
                // Pre-open migration connections toward every existing
                // peer; peers dial us lazily on their side.
                for peer in &info.peers {
                    let _ = migrator_conns.reserve(&peer.migrator_addr(), 1);
                }
                let stacks = Arc::new(
                    StackAllocator::new(info.stack_cluster).map_err(Error::Transport)?,
                );
                let reaper = Reaper::new(Arc::clone(&stacks));
                (info.lpid, Some(stacks), Some(reaper))
            }
            RuntimeMode::Client => {
                if lpid_hint == 0 {
                    return Err(Error::Config(
                        "client mode requires the lpid to join".into(),
                    ));
                }
                (lpid_hint, None, None)
            }
        };

        let rt = Arc::new(Runtime {
            mode,
            lpid,
            self_ip,
            rpc_addr,
            migrator_addr,
            proclets: ProcletManager::new(),
            stacks,
            reaper,
            caller: ProcletCaller::new(Arc::clone(&ctrl)),
            ctrl,
            migrator_conns,
            migrator: Migrator::new(),
            pressure: SpinLock::new(None),
            monitor: SpinLock::new(None),
            service_threads: SpinLock::new(Vec::new()),
            done: Arc::clone(&done),
        });

        if let Some(listener) = rpc_listener {
            let th = server::spawn_accept_loop(Arc::clone(&rt), listener);
            rt.service_threads.lock().push(th);
        }
        if let Some(listener) = migrator_listener {
            let th = crate::migrator::spawn_loader_loop(Arc::clone(&rt), listener);
            rt.service_threads.lock().push(th);
        }
        if mode == RuntimeMode::Server {
            *rt.pressure.lock() = Some(PressureHandler::start(&rt, cfg.pressure_shm.as_deref()));
        }
        *rt.monitor.lock() = Some(Monitor::start(&rt));

        let mut default = DEFAULT_RUNTIME.lock();
        if default.is_none() {
            *default = Some(Arc::clone(&rt));
        }
        drop(default);

        info!(
            "runtime up: mode {:?}, lpid {}, rpc {}, migrator {}",
            mode, lpid, rpc_addr, migrator_addr
        );
        Ok(rt)
    }

    /// Makes this runtime the ambient one for the calling thread until the
    /// guard drops.
    pub fn enter(self: &Arc<Runtime>) -> AmbientGuard {
        let prev = TLS_AMBIENT.with(|c| c.borrow_mut().replace(Arc::clone(self)));
        AmbientGuard { prev }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn lpid(&self) -> Lpid {
        self.lpid
    }

    pub fn self_ip(&self) -> u32 {
        self.self_ip
    }

    pub fn rpc_addr(&self) -> NodeAddr {
        self.rpc_addr
    }

    pub fn migrator_addr(&self) -> NodeAddr {
        self.migrator_addr
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    pub(crate) fn proclets(&self) -> &ProcletManager {
        &self.proclets
    }

    pub(crate) fn stacks(&self) -> &Arc<StackAllocator> {
        self.stacks.as_ref().expect("client mode has no stacks")
    }

    pub(crate) fn reaper(&self) -> &Reaper {
        self.reaper.as_ref().expect("client mode has no reaper")
    }

    pub(crate) fn ctrl(&self) -> &ControllerClient {
        &self.ctrl
    }

    pub(crate) fn caller(&self) -> &ProcletCaller {
        &self.caller
    }

    pub(crate) fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub(crate) fn migrator_conns(&self) -> &ConnectionManager<NodeAddr, TcpStream> {
        &self.migrator_conns
    }

    pub fn pressure_handler(&self) -> Option<PressureHandler> {
        self.pressure.lock().clone()
    }

    /// Creates a migratable proclet holding `state`, placed by the
    /// controller. `None` means the cluster is out of heap windows or
    /// placement targets.
    pub fn make_proclet<T: registry::ProcletState>(
        self: &Arc<Runtime>,
        state: &T,
    ) -> Option<RemUniquePtr<T>> {
        self.make_proclet_opts(state, true, None)
    }

    /// Pinned proclets are never picked for migration.
    pub fn make_proclet_pinned<T: registry::ProcletState>(
        self: &Arc<Runtime>,
        state: &T,
    ) -> Option<RemUniquePtr<T>> {
        self.make_proclet_opts(state, false, None)
    }

    pub fn make_proclet_opts<T: registry::ProcletState>(
        self: &Arc<Runtime>,
        state: &T,
        migratable: bool,
        ip_hint: Option<u32>,
    ) -> Option<RemUniquePtr<T>> {
        let type_sel = registry::type_sel_of::<T>();
        let (id, addr) = self.ctrl.allocate_proclet(self.lpid, ip_hint).ok()??;
        self.caller.learn_location(id, addr);
        let state_bytes = bincode::serialize(state).ok()?;
        let payload = self
            .caller
            .call(
                id,
                &ProcletRequest::Construct {
                    id,
                    type_sel,
                    migratable,
                    state: &state_bytes,
                },
            )
            .ok()?;
        let raw = u64::from_le_bytes(payload.get(0..8)?.try_into().ok()?);
        Some(unsafe { RemUniquePtr::from_raw(id, raw) })
    }

    /// Orderly tear-down, reverse of the init order. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("runtime shutting down");
        {
            // Stop routing ambient calls through a dead runtime.
            let mut default = DEFAULT_RUNTIME.lock();
            if let Some(cur) = default.as_ref() {
                if std::ptr::eq(cur.as_ref(), self) {
                    *default = None;
                }
            }
        }
        if let Some(pressure) = self.pressure.lock().take() {
            pressure.shutdown();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.shutdown();
        }
        let threads: Vec<_> = self.service_threads.lock().drain(..).collect();
        for th in threads {
            let _ = th.join();
        }
        self.caller.shutdown();
        self.migrator_conns.drain(|conn| {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        });
        if let Some(reaper) = self.reaper.as_ref() {
            reaper.shutdown();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).map_err(Error::Transport)?;
    listener.set_nonblocking(true).map_err(Error::Transport)?;
    Ok(listener)
}
