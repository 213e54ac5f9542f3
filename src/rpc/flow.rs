use crate::commons::NodeAddr;
use crate::rpc::{ReqHdr, RespHdr, CMD_CALL, INITIAL_CREDITS, RPC_HDR_SIZE};
use crate::sync::{SpinLock, Waiter, WakeStatus};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One TCP flow of the RPC protocol. A flow multiplexes any number of
/// concurrent calls distinguished by completion token, under a credit
/// window: new calls are emitted only while `sent - recv < credits`, where
/// the server refreshes `credits` on every response.
///
/// A dedicated receiver thread matches responses to parked callers; senders
/// that exhaust the window park until a response frees a slot.
pub struct RpcFlow {
    peer: NodeAddr,
    writer: Mutex<TcpStream>,
    state: SpinLock<FlowState>,
    broken: AtomicBool,
    receiver: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

struct FlowState {
    credits: u32,
    sent: u64,
    recv: u64,
    next_token: u64,
    pending: HashMap<u64, Arc<CallSlot>>,
    window_waiters: VecDeque<Arc<Waiter>>,
}

struct CallSlot {
    waiter: Waiter,
    result: SpinLock<Option<io::Result<Vec<u8>>>>,
}

impl RpcFlow {
    pub fn dial(peer: NodeAddr) -> io::Result<Arc<RpcFlow>> {
        let conn = TcpStream::connect(peer.to_socket_addr())?;
        conn.set_nodelay(true)?;
        let reader = conn.try_clone()?;
        let flow = Arc::new(RpcFlow {
            peer,
            writer: Mutex::new(conn),
            state: SpinLock::new(FlowState {
                credits: INITIAL_CREDITS,
                sent: 0,
                recv: 0,
                next_token: 1,
                pending: HashMap::new(),
                window_waiters: VecDeque::new(),
            }),
            broken: AtomicBool::new(false),
            receiver: SpinLock::new(None),
        });
        let worker = {
            let flow = Arc::clone(&flow);
            std::thread::Builder::new()
                .name(format!("drift-flow-{}", peer))
                .spawn(move || flow.receive_loop(reader))?
        };
        *flow.receiver.lock() = Some(worker);
        Ok(flow)
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Issues one call and blocks until its response arrives. Concurrent
    /// callers share the flow freely.
    pub fn call(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let (token, slot, demand) = self.acquire_window()?;

        let hdr = ReqHdr {
            cmd: CMD_CALL,
            demand,
            payload_len: payload.len() as u64,
            token,
        };
        {
            let mut writer = self.writer.lock().unwrap();
            let write = writer
                .write_all(&hdr.encode())
                .and_then(|_| writer.write_all(payload));
            if let Err(err) = write {
                drop(writer);
                self.fail_all(&err);
                return Err(err);
            }
        }

        slot.waiter.wait();
        let result = slot
            .result
            .lock()
            .take()
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::Other, "flow torn down")));
        result
    }

    /// Reserves a window slot, parking while `sent - recv >= credits`.
    fn acquire_window(&self) -> io::Result<(u64, Arc<CallSlot>, u32)> {
        loop {
            if self.is_broken() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "flow is broken"));
            }
            let mut st = self.state.lock();
            if st.sent - st.recv < u64::from(st.credits.max(1)) {
                let token = st.next_token;
                st.next_token += 1;
                st.sent += 1;
                let slot = Arc::new(CallSlot {
                    waiter: Waiter::new(),
                    result: SpinLock::new(None),
                });
                st.pending.insert(token, Arc::clone(&slot));
                let demand = st.pending.len() as u32;
                return Ok((token, slot, demand));
            }
            let waiter = Arc::new(Waiter::new());
            st.window_waiters.push_back(Arc::clone(&waiter));
            drop(st);
            waiter.wait();
        }
    }

    fn receive_loop(&self, mut reader: TcpStream) {
        loop {
            let mut hdr_buf = [0u8; RPC_HDR_SIZE];
            if let Err(err) = reader.read_exact(&mut hdr_buf) {
                self.fail_all(&err);
                return;
            }
            let hdr = RespHdr::decode(&hdr_buf);
            let mut payload = vec![0u8; hdr.payload_len as usize];
            if let Err(err) = reader.read_exact(&mut payload) {
                self.fail_all(&err);
                return;
            }

            let mut st = self.state.lock();
            st.credits = hdr.credits;
            st.recv += 1;
            let slot = st.pending.remove(&hdr.token);
            let window_waiter = st.window_waiters.pop_front();
            drop(st);

            match slot {
                Some(slot) => {
                    *slot.result.lock() = Some(Ok(payload));
                    slot.waiter.wake(WakeStatus::Notified);
                }
                None => debug!("response for unknown token {} from {}", hdr.token, self.peer),
            }
            if let Some(w) = window_waiter {
                w.wake(WakeStatus::Notified);
            }
        }
    }

    /// Marks the flow dead and fails every parked caller; they retry
    /// through a fresh connection.
    fn fail_all(&self, err: &io::Error) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("flow to {} broken: {}", self.peer, err);
        let mut st = self.state.lock();
        let pending: Vec<_> = st.pending.drain().map(|(_, slot)| slot).collect();
        let waiters: Vec<_> = st.window_waiters.drain(..).collect();
        drop(st);
        for slot in pending {
            *slot.result.lock() = Some(Err(io::Error::new(err.kind(), "flow broken")));
            slot.waiter.wake(WakeStatus::Notified);
        }
        for w in waiters {
            w.wake(WakeStatus::Notified);
        }
    }

    pub fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        self.fail_all(&io::Error::new(io::ErrorKind::Other, "closed"));
        let worker = self.receiver.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for RpcFlow {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}
