use crate::commons::{Fingerprint, Lpid, NodeAddr, ProcletId, Resource};
use crate::ctrl::{read_msg, write_msg, CtrlRequest, CtrlResponse, NodeSpec, RegisterInfo};
use crate::error::{Error, Result};
use crate::rpc::conn_mgr::ConnectionManager;
use std::net::{SocketAddr, TcpStream};

const NUM_PER_CORE_CACHED_CONNS: usize = 1;

/// Client side of the controller protocol. Connections are cached per core;
/// the controller is only consulted on cache-miss resolution, placement,
/// and lifecycle operations, never on the per-call data path.
pub struct ControllerClient {
    conns: ConnectionManager<(), TcpStream>,
}

impl ControllerClient {
    pub fn new(ctrl_addr: SocketAddr) -> ControllerClient {
        ControllerClient {
            conns: ConnectionManager::new(NUM_PER_CORE_CACHED_CONNS, move |_| {
                let conn = TcpStream::connect(ctrl_addr)?;
                conn.set_nodelay(true)?;
                Ok(conn)
            }),
        }
    }

    fn request(&self, req: &CtrlRequest) -> Result<CtrlResponse> {
        let mut conn = self.conns.get(&())?;
        let io = write_msg(&mut conn, req).and_then(|_| read_msg(&mut conn));
        match io {
            Ok(resp) => {
                self.conns.put(&(), conn);
                Ok(resp)
            }
            // The cached connection may be stale (controller restarted or
            // idle-closed); retry once on a fresh one before giving up.
            Err(_) => {
                let mut conn = self.conns.get(&())?;
                let resp = write_msg(&mut conn, req).and_then(|_| read_msg(&mut conn))?;
                self.conns.put(&(), conn);
                Ok(resp)
            }
        }
    }

    pub fn register_node(
        &self,
        node: NodeSpec,
        lpid_hint: Lpid,
        fingerprint: Fingerprint,
    ) -> Result<RegisterInfo> {
        match self.request(&CtrlRequest::RegisterNode {
            node,
            lpid_hint,
            fingerprint,
        })? {
            CtrlResponse::RegisterNode(Some(info)) => Ok(info),
            CtrlResponse::RegisterNode(None) => {
                Err(Error::Rejected("node registration refused"))
            }
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }

    pub fn allocate_proclet(
        &self,
        lpid: Lpid,
        ip_hint: Option<u32>,
    ) -> Result<Option<(ProcletId, NodeAddr)>> {
        match self.request(&CtrlRequest::AllocateProclet { lpid, ip_hint })? {
            CtrlResponse::AllocateProclet(result) => Ok(result),
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }

    pub fn destroy_proclet(&self, id: ProcletId) -> Result<bool> {
        match self.request(&CtrlRequest::DestroyProclet { id })? {
            CtrlResponse::DestroyProclet(ok) => Ok(ok),
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }

    pub fn resolve_proclet(&self, id: ProcletId) -> Result<Option<NodeAddr>> {
        match self.request(&CtrlRequest::ResolveProclet { id })? {
            CtrlResponse::ResolveProclet(addr) => Ok(addr),
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }

    pub fn get_migration_dest(
        &self,
        lpid: Lpid,
        requestor_ip: u32,
        resource: Resource,
    ) -> Result<Option<NodeSpec>> {
        match self.request(&CtrlRequest::GetMigrationDest {
            lpid,
            requestor_ip,
            resource,
        })? {
            CtrlResponse::GetMigrationDest(addr) => Ok(addr),
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }

    pub fn update_location(&self, id: ProcletId, addr: NodeAddr) -> Result<()> {
        match self.request(&CtrlRequest::UpdateLocation { id, addr })? {
            CtrlResponse::UpdateLocation => Ok(()),
            _ => Err(Error::Rejected("controller protocol mismatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::server::ControllerServer;

    fn node(ip: u32) -> NodeSpec {
        NodeSpec {
            ip,
            rpc_port: 7000,
            migrator_port: 7001,
        }
    }

    #[test]
    fn register_allocate_resolve_destroy_over_tcp() {
        let server = ControllerServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut handle = server.spawn();
        let client = ControllerClient::new(handle.addr);

        let info = client.register_node(node(1), 0, [7; 16]).unwrap();
        assert!(info.peers.is_empty());

        let (id, addr) = client.allocate_proclet(info.lpid, None).unwrap().unwrap();
        assert_eq!(addr, node(1).rpc_addr());
        assert_eq!(client.resolve_proclet(id).unwrap(), Some(addr));

        assert!(client.destroy_proclet(id).unwrap());
        assert_eq!(client.resolve_proclet(id).unwrap(), None);

        // Fingerprint mismatch comes back as a rejection, not a transport
        // error.
        assert!(client.register_node(node(2), info.lpid, [9; 16]).is_err());
        handle.shutdown();
    }
}
