use crate::ctrl::controller::Controller;
use crate::ctrl::{read_msg, write_msg, CtrlRequest, CtrlResponse};
use log::{debug, info};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// TCP front of the controller. One thread per client connection; every
/// request locks the single-writer directory for its duration.
pub struct ControllerServer {
    listener: TcpListener,
    ctrl: Arc<Mutex<Controller>>,
    done: Arc<AtomicBool>,
}

impl ControllerServer {
    pub fn bind(addr: SocketAddr) -> io::Result<ControllerServer> {
        ControllerServer::bind_with(addr, Controller::new())
    }

    pub fn bind_with(addr: SocketAddr, ctrl: Controller) -> io::Result<ControllerServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("controller listening on {}", listener.local_addr()?);
        Ok(ControllerServer {
            listener,
            ctrl: Arc::new(Mutex::new(ctrl)),
            done: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    /// Accept loop; returns once the done flag is raised.
    pub fn run(&self) {
        while !self.done.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((conn, peer)) => {
                    debug!("controller client connected from {}", peer);
                    conn.set_nonblocking(false).ok();
                    conn.set_nodelay(true).ok();
                    let ctrl = Arc::clone(&self.ctrl);
                    let done = Arc::clone(&self.done);
                    std::thread::Builder::new()
                        .name("drift-ctrl-conn".into())
                        .spawn(move || handle_conn(conn, ctrl, done))
                        .ok();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    debug!("controller accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Runs the accept loop on a background thread, for in-process tests.
    pub fn spawn(self) -> ControllerHandle {
        let addr = self.local_addr();
        let done = self.shutdown_handle();
        let th = std::thread::Builder::new()
            .name("drift-ctrl".into())
            .spawn(move || self.run())
            .expect("spawn controller");
        ControllerHandle {
            addr,
            done,
            th: Some(th),
        }
    }
}

fn handle_conn(mut conn: TcpStream, ctrl: Arc<Mutex<Controller>>, done: Arc<AtomicBool>) {
    loop {
        if done.load(Ordering::Acquire) {
            return;
        }
        let req: CtrlRequest = match read_msg(&mut conn) {
            Ok(req) => req,
            Err(_) => return,
        };
        let resp = {
            let mut ctrl = ctrl.lock().unwrap();
            match req {
                CtrlRequest::RegisterNode {
                    node,
                    lpid_hint,
                    fingerprint,
                } => CtrlResponse::RegisterNode(ctrl.register_node(node, lpid_hint, fingerprint)),
                CtrlRequest::AllocateProclet { lpid, ip_hint } => {
                    CtrlResponse::AllocateProclet(ctrl.allocate_proclet(lpid, ip_hint))
                }
                CtrlRequest::DestroyProclet { id } => {
                    CtrlResponse::DestroyProclet(ctrl.destroy_proclet(id))
                }
                CtrlRequest::ResolveProclet { id } => {
                    CtrlResponse::ResolveProclet(ctrl.resolve_proclet(id))
                }
                CtrlRequest::GetMigrationDest {
                    lpid,
                    requestor_ip,
                    resource,
                } => CtrlResponse::GetMigrationDest(
                    ctrl.get_migration_dest(lpid, requestor_ip, resource),
                ),
                CtrlRequest::UpdateLocation { id, addr } => {
                    ctrl.update_location(id, addr);
                    CtrlResponse::UpdateLocation
                }
            }
        };
        if write_msg(&mut conn, &resp).is_err() {
            return;
        }
    }
}

/// Running controller plus its shutdown switch.
pub struct ControllerHandle {
    pub addr: SocketAddr,
    done: Arc<AtomicBool>,
    th: Option<std::thread::JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn shutdown(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(th) = self.th.take() {
            let _ = th.join();
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
