pub mod client;
pub mod controller;
pub mod server;

use crate::commons::{Fingerprint, Lpid, NodeAddr, ProcletId, Resource, VAddrRange};
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use std::io::{self, Read, Write};

/// A node as the controller sees it: where to reach its proclet server and
/// its migrator listener.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct NodeSpec {
    pub ip: u32,
    pub rpc_port: u16,
    pub migrator_port: u16,
}

impl NodeSpec {
    pub fn rpc_addr(&self) -> NodeAddr {
        NodeAddr {
            ip: self.ip,
            port: self.rpc_port,
        }
    }

    pub fn migrator_addr(&self) -> NodeAddr {
        NodeAddr {
            ip: self.ip,
            port: self.migrator_port,
        }
    }
}

/// Controller requests; the bincode variant tag is the operation code.
#[derive(Serialize, Deserialize, Debug)]
pub enum CtrlRequest {
    RegisterNode {
        node: NodeSpec,
        /// 0 asks for a fresh lpid; anything else joins an existing one.
        lpid_hint: Lpid,
        fingerprint: Fingerprint,
    },
    AllocateProclet {
        lpid: Lpid,
        ip_hint: Option<u32>,
    },
    DestroyProclet {
        id: ProcletId,
    },
    ResolveProclet {
        id: ProcletId,
    },
    GetMigrationDest {
        lpid: Lpid,
        requestor_ip: u32,
        resource: Resource,
    },
    UpdateLocation {
        id: ProcletId,
        addr: NodeAddr,
    },
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterInfo {
    pub lpid: Lpid,
    pub stack_cluster: VAddrRange,
    /// Peers already in the lpid; the joining node pre-opens migrator
    /// connections to each so migration never dials on the hot path.
    pub peers: Vec<NodeSpec>,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum CtrlResponse {
    RegisterNode(Option<RegisterInfo>),
    AllocateProclet(Option<(ProcletId, NodeAddr)>),
    DestroyProclet(bool),
    ResolveProclet(Option<NodeAddr>),
    /// Carries the full node spec: the requestor forwards calls to the rpc
    /// port but streams state to the migrator port.
    GetMigrationDest(Option<NodeSpec>),
    UpdateLocation,
}

/// Length-prefixed bincode framing shared by both directions of the
/// controller protocol.
pub fn write_msg<T: Serialize>(conn: &mut impl Write, msg: &T) -> io::Result<()> {
    let body = bincode::serialize(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    conn.write_all(&(body.len() as u64).to_le_bytes())?;
    conn.write_all(&body)
}

pub fn read_msg<T: serde::de::DeserializeOwned>(conn: &mut impl Read) -> io::Result<T> {
    let mut len_buf = [0u8; 8];
    conn.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf[..].try_into().unwrap()) as usize;
    let mut body = vec![0u8; len];
    conn.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trips_requests() {
        let req = CtrlRequest::AllocateProclet {
            lpid: 3,
            ip_hint: Some(0x0a000001),
        };
        let mut buf = Vec::new();
        write_msg(&mut buf, &req).unwrap();
        let back: CtrlRequest = read_msg(&mut buf.as_slice()).unwrap();
        match back {
            CtrlRequest::AllocateProclet { lpid, ip_hint } => {
                assert_eq!(lpid, 3);
                assert_eq!(ip_hint, Some(0x0a000001));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
