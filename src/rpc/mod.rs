pub mod client;
pub mod conn_mgr;
pub mod flow;

use crate::commons::{NodeAddr, ProcletId};
use std::convert::TryInto;

/// Initial per-flow credit window; a client may keep this many calls
/// outstanding on one flow before it must wait for responses.
pub const INITIAL_CREDITS: u32 = 128;

pub const RPC_HDR_SIZE: usize = 24;

pub const CMD_CALL: u32 = 0;
pub const CMD_UPDATE: u32 = 1;

/// Transport-level return codes carried in the first response byte.
pub const RC_OK: u8 = 0;
pub const RC_FORWARDED: u8 = 1;
pub const RC_CLIENT_RETRY: u8 = 2;

/// Request header (little-endian, 24 B): cmd, demand (caller's queued +
/// inflight count), payload length, completion token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReqHdr {
    pub cmd: u32,
    pub demand: u32,
    pub payload_len: u64,
    pub token: u64,
}

impl ReqHdr {
    pub fn encode(&self) -> [u8; RPC_HDR_SIZE] {
        let mut buf = [0u8; RPC_HDR_SIZE];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&self.demand.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.token.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RPC_HDR_SIZE]) -> ReqHdr {
        ReqHdr {
            cmd: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            demand: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            payload_len: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            token: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Response header (24 B): cmd, credits now available to the sender,
/// payload length, completion token being answered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RespHdr {
    pub cmd: u32,
    pub credits: u32,
    pub payload_len: u64,
    pub token: u64,
}

impl RespHdr {
    pub fn encode(&self) -> [u8; RPC_HDR_SIZE] {
        let mut buf = [0u8; RPC_HDR_SIZE];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&self.credits.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.token.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RPC_HDR_SIZE]) -> RespHdr {
        RespHdr {
            cmd: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            credits: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            payload_len: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            token: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Proclet-control commands demultiplexed by the proclet server.
pub const PC_INVOKE: u32 = 0;
pub const PC_CONSTRUCT: u32 = 1;
pub const PC_UPDATE_REF_CNT: u32 = 2;
pub const PC_DESTRUCT: u32 = 3;

/// One decoded proclet-control request.
#[derive(Debug)]
pub enum ProcletRequest<'a> {
    Invoke {
        id: ProcletId,
        selector: u64,
        args: &'a [u8],
    },
    Construct {
        id: ProcletId,
        type_sel: u64,
        migratable: bool,
        state: &'a [u8],
    },
    UpdateRefCnt {
        id: ProcletId,
        delta: i64,
    },
    Destruct {
        id: ProcletId,
    },
}

impl<'a> ProcletRequest<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ProcletRequest::Invoke { id, selector, args } => {
                buf.extend_from_slice(&PC_INVOKE.to_le_bytes());
                buf.extend_from_slice(&id.0.to_le_bytes());
                buf.extend_from_slice(&selector.to_le_bytes());
                buf.extend_from_slice(args);
            }
            ProcletRequest::Construct {
                id,
                type_sel,
                migratable,
                state,
            } => {
                buf.extend_from_slice(&PC_CONSTRUCT.to_le_bytes());
                buf.extend_from_slice(&id.0.to_le_bytes());
                buf.extend_from_slice(&type_sel.to_le_bytes());
                buf.push(*migratable as u8);
                buf.extend_from_slice(state);
            }
            ProcletRequest::UpdateRefCnt { id, delta } => {
                buf.extend_from_slice(&PC_UPDATE_REF_CNT.to_le_bytes());
                buf.extend_from_slice(&id.0.to_le_bytes());
                buf.extend_from_slice(&delta.to_le_bytes());
            }
            ProcletRequest::Destruct { id } => {
                buf.extend_from_slice(&PC_DESTRUCT.to_le_bytes());
                buf.extend_from_slice(&id.0.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &'a [u8]) -> Option<ProcletRequest<'a>> {
        if buf.len() < 12 {
            return None;
        }
        let cmd = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let id = ProcletId(u64::from_le_bytes(buf[4..12].try_into().unwrap()));
        let rest = &buf[12..];
        match cmd {
            PC_INVOKE => {
                if rest.len() < 8 {
                    return None;
                }
                Some(ProcletRequest::Invoke {
                    id,
                    selector: u64::from_le_bytes(rest[0..8].try_into().unwrap()),
                    args: &rest[8..],
                })
            }
            PC_CONSTRUCT => {
                if rest.len() < 9 {
                    return None;
                }
                Some(ProcletRequest::Construct {
                    id,
                    type_sel: u64::from_le_bytes(rest[0..8].try_into().unwrap()),
                    migratable: rest[8] != 0,
                    state: &rest[9..],
                })
            }
            PC_UPDATE_REF_CNT => {
                if rest.len() < 8 {
                    return None;
                }
                Some(ProcletRequest::UpdateRefCnt {
                    id,
                    delta: i64::from_le_bytes(rest[0..8].try_into().unwrap()),
                })
            }
            PC_DESTRUCT => Some(ProcletRequest::Destruct { id }),
            _ => None,
        }
    }
}

/// Proclet-control response: `{u8 rc, u64 payload_len, payload}`. On
/// `FORWARDED`, the payload is the new owner's `{u32 ip, u16 port}`.
pub fn encode_response(rc: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.push(rc);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn decode_response(buf: &[u8]) -> Option<(u8, &[u8])> {
    if buf.len() < 9 {
        return None;
    }
    let rc = buf[0];
    let len = u64::from_le_bytes(buf[1..9].try_into().unwrap()) as usize;
    if buf.len() < 9 + len {
        return None;
    }
    Some((rc, &buf[9..9 + len]))
}

pub fn encode_forward_addr(addr: NodeAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&addr.ip.to_le_bytes());
    buf.extend_from_slice(&addr.port.to_le_bytes());
    buf
}

pub fn decode_forward_addr(buf: &[u8]) -> Option<NodeAddr> {
    if buf.len() < 6 {
        return None;
    }
    Some(NodeAddr {
        ip: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        port: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_little_endian() {
        let req = ReqHdr {
            cmd: CMD_CALL,
            demand: 3,
            payload_len: 0x1122_3344,
            token: 0xDEAD_BEEF,
        };
        let bytes = req.encode();
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[4], 3);
        assert_eq!(ReqHdr::decode(&bytes), req);

        let resp = RespHdr {
            cmd: CMD_CALL,
            credits: 127,
            payload_len: 9,
            token: 0xDEAD_BEEF,
        };
        assert_eq!(RespHdr::decode(&resp.encode()), resp);
    }

    #[test]
    fn proclet_request_round_trips() {
        let id = ProcletId(0x4000_0000_0000);
        let encoded = ProcletRequest::Invoke {
            id,
            selector: 42,
            args: b"args",
        }
        .encode();
        match ProcletRequest::decode(&encoded).unwrap() {
            ProcletRequest::Invoke { id: i, selector, args } => {
                assert_eq!(i, id);
                assert_eq!(selector, 42);
                assert_eq!(args, b"args");
            }
            other => panic!("wrong variant: {:?}", other),
        }

        let encoded = ProcletRequest::UpdateRefCnt { id, delta: -1 }.encode();
        match ProcletRequest::decode(&encoded).unwrap() {
            ProcletRequest::UpdateRefCnt { delta, .. } => assert_eq!(delta, -1),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn response_and_forward_addr_round_trip() {
        let resp = encode_response(RC_OK, b"hello");
        let (rc, payload) = decode_response(&resp).unwrap();
        assert_eq!(rc, RC_OK);
        assert_eq!(payload, b"hello");

        let addr = NodeAddr { ip: 0x7f000001, port: 9999 };
        let fwd = encode_forward_addr(addr);
        assert_eq!(fwd.len(), 6);
        assert_eq!(decode_forward_addr(&fwd).unwrap(), addr);
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        assert!(ProcletRequest::decode(&[0u8; 4]).is_none());
        assert!(decode_response(&[0u8; 3]).is_none());
        assert!(decode_forward_addr(&[1, 2]).is_none());
    }
}
