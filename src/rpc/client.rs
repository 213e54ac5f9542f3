use crate::commons::{NodeAddr, ProcletId};
use crate::ctrl::client::ControllerClient;
use crate::error::{Error, Result};
use crate::rpc::conn_mgr::ConnectionManager;
use crate::rpc::flow::RpcFlow;
use crate::rpc::{
    decode_forward_addr, decode_response, ProcletRequest, RC_CLIENT_RETRY, RC_FORWARDED, RC_OK,
};
use crate::sync::SpinLock;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const NUM_PER_CORE_CACHED_FLOWS: usize = 2;
/// Bounded-backoff parameters for CLIENT_RETRY.
const RETRY_BACKOFF_START_US: u64 = 100;
const RETRY_BACKOFF_CAP_US: u64 = 10_000;
/// Transport failures (peer disconnects) are retried through fresh
/// connections this many times before surfacing.
const MAX_TRANSPORT_RETRIES: u32 = 50;

/// Issues proclet-control calls, hiding the transient ownership codes:
/// `FORWARDED` invalidates the address cache and retries at the new owner,
/// `CLIENT_RETRY` backs off and retries the same target. Callers only ever
/// see `OK` payloads or hard errors.
pub struct ProcletCaller {
    flows: ConnectionManager<NodeAddr, Arc<RpcFlow>>,
    addr_cache: SpinLock<HashMap<ProcletId, NodeAddr>>,
    ctrl: Arc<ControllerClient>,
}

impl ProcletCaller {
    pub fn new(ctrl: Arc<ControllerClient>) -> ProcletCaller {
        ProcletCaller {
            flows: ConnectionManager::new(NUM_PER_CORE_CACHED_FLOWS, |addr: &NodeAddr| {
                RpcFlow::dial(*addr)
            }),
            addr_cache: SpinLock::new(HashMap::new()),
            ctrl,
        }
    }

    fn resolve(&self, id: ProcletId) -> Result<NodeAddr> {
        if let Some(addr) = self.addr_cache.lock().get(&id) {
            return Ok(*addr);
        }
        match self.ctrl.resolve_proclet(id)? {
            Some(addr) => {
                self.addr_cache.lock().insert(id, addr);
                Ok(addr)
            }
            None => Err(Error::Rejected("proclet unknown to controller")),
        }
    }

    /// Seeds the cache at construct time, saving the first call a
    /// controller round trip.
    pub fn learn_location(&self, id: ProcletId, addr: NodeAddr) {
        self.addr_cache.lock().insert(id, addr);
    }

    pub fn forget_location(&self, id: ProcletId) {
        self.addr_cache.lock().remove(&id);
    }

    /// Sends `req` to wherever `id` lives and returns the `OK` payload.
    pub fn call(&self, id: ProcletId, req: &ProcletRequest<'_>) -> Result<Vec<u8>> {
        let encoded = req.encode();
        let mut backoff_us = RETRY_BACKOFF_START_US;
        let mut transport_failures = 0u32;
        loop {
            let addr = self.resolve(id)?;
            let flow = match self.flows.get(&addr) {
                Ok(flow) => flow,
                Err(err) => {
                    transport_failures += 1;
                    if transport_failures > MAX_TRANSPORT_RETRIES {
                        return Err(Error::Transport(err));
                    }
                    std::thread::sleep(Duration::from_micros(backoff_us));
                    backoff_us = (backoff_us * 2).min(RETRY_BACKOFF_CAP_US);
                    continue;
                }
            };

            let reply = flow.call(&encoded);
            if flow.is_broken() {
                flow.close();
            } else {
                self.flows.put(&addr, flow);
            }

            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    // The connection died with the call in flight; the
                    // result is unknown, so retry through a fresh flow.
                    transport_failures += 1;
                    if transport_failures > MAX_TRANSPORT_RETRIES {
                        return Err(Error::Transport(err));
                    }
                    debug!("retrying {} after transport error", id);
                    continue;
                }
            };

            let (rc, payload) =
                decode_response(&reply).ok_or(Error::Rejected("malformed response"))?;
            match rc {
                RC_OK => return Ok(payload.to_vec()),
                RC_FORWARDED => {
                    match decode_forward_addr(payload).filter(|a| !a.is_none()) {
                        Some(new_addr) => {
                            debug!("{} forwarded to {}", id, new_addr);
                            self.addr_cache.lock().insert(id, new_addr);
                        }
                        None => {
                            // Owner unknown at the contacted node; fall back
                            // to a controller re-resolution.
                            self.forget_location(id);
                        }
                    }
                    continue;
                }
                RC_CLIENT_RETRY => {
                    std::thread::sleep(Duration::from_micros(backoff_us));
                    backoff_us = (backoff_us * 2).min(RETRY_BACKOFF_CAP_US);
                    continue;
                }
                other => {
                    warn!("unknown rc {} from {}", other, addr);
                    return Err(Error::Rejected("unknown return code"));
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.flows.drain(|flow| flow.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{
        encode_forward_addr, encode_response, ReqHdr, RespHdr, CMD_CALL, RPC_HDR_SIZE,
    };
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Speaks the server side of the framing, answering each request with
    /// the next scripted response payload (cycling on the last).
    fn scripted_server(script: Vec<Vec<u8>>) -> NodeAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = NodeAddr::from_socket_addr(listener.local_addr().unwrap());
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let mut conn = match conn {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let script = script.clone();
                std::thread::spawn(move || {
                    let mut step = 0;
                    loop {
                        let mut hdr_buf = [0u8; RPC_HDR_SIZE];
                        if conn.read_exact(&mut hdr_buf).is_err() {
                            return;
                        }
                        let hdr = ReqHdr::decode(&hdr_buf);
                        let mut payload = vec![0u8; hdr.payload_len as usize];
                        if conn.read_exact(&mut payload).is_err() {
                            return;
                        }
                        let body = &script[step.min(script.len() - 1)];
                        step += 1;
                        let resp = RespHdr {
                            cmd: CMD_CALL,
                            credits: 64,
                            payload_len: body.len() as u64,
                            token: hdr.token,
                        };
                        if conn.write_all(&resp.encode()).is_err()
                            || conn.write_all(body).is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn caller() -> ProcletCaller {
        // Points at nothing; every test pre-seeds the address cache so the
        // controller is never consulted.
        ProcletCaller::new(Arc::new(ControllerClient::new(
            "127.0.0.1:1".parse().unwrap(),
        )))
    }

    #[test]
    fn client_retry_backs_off_and_retries_same_target() {
        let addr = scripted_server(vec![
            encode_response(RC_CLIENT_RETRY, &[]),
            encode_response(RC_CLIENT_RETRY, &[]),
            encode_response(RC_OK, b"finally"),
        ]);
        let caller = caller();
        let id = ProcletId(0x4000_0000_0000);
        caller.learn_location(id, addr);
        let reply = caller
            .call(id, &crate::rpc::ProcletRequest::Destruct { id })
            .unwrap();
        assert_eq!(reply, b"finally");
        caller.shutdown();
    }

    #[test]
    fn forwarded_chases_the_new_owner() {
        let new_owner = scripted_server(vec![encode_response(RC_OK, b"moved-in")]);
        let old_owner = scripted_server(vec![encode_response(
            RC_FORWARDED,
            &encode_forward_addr(new_owner),
        )]);
        let caller = caller();
        let id = ProcletId(0x4000_4000_0000);
        caller.learn_location(id, old_owner);
        let reply = caller
            .call(id, &crate::rpc::ProcletRequest::Destruct { id })
            .unwrap();
        assert_eq!(reply, b"moved-in");
        caller.shutdown();
    }
}
