use crate::commons::{
    Fingerprint, Lpid, NodeAddr, ProcletId, Resource, VAddrRange, MAX_HEAP_VADDR,
    MAX_STACK_CLUSTER_VADDR, MIN_HEAP_VADDR, MIN_STACK_CLUSTER_VADDR, PROCLET_HEAP_SIZE,
    STACK_CLUSTER_SIZE,
};
use crate::ctrl::{NodeSpec, RegisterInfo};
use log::{info, warn};
use std::collections::{BTreeSet, HashMap};

/// Picks a migration destination among the lpid's members. Pluggable so
/// deployments can rank peers by capacity; the default is first-fit among
/// peers excluding the requestor.
pub trait PlacementPolicy: Send {
    fn pick_dest(
        &mut self,
        peers: &[NodeSpec],
        requestor_ip: u32,
        resource: Resource,
    ) -> Option<NodeSpec>;
}

pub struct FirstFitPlacement;

impl PlacementPolicy for FirstFitPlacement {
    fn pick_dest(
        &mut self,
        peers: &[NodeSpec],
        requestor_ip: u32,
        _resource: Resource,
    ) -> Option<NodeSpec> {
        peers.iter().find(|n| n.ip != requestor_ip).copied()
    }
}

struct LpidInfo {
    nodes: Vec<NodeSpec>,
    /// Round-robin cursor for proclet placement.
    cursor: usize,
    stack_clusters: HashMap<NodeSpec, VAddrRange>,
}

/// Single-writer cluster directory: virtual-address allocation, lpid
/// membership, and proclet location. All mutation happens under the
/// server's one mutex; the controller is off the data plane except for
/// cache-miss resolution and placement.
pub struct Controller {
    free_heap_segments: Vec<VAddrRange>,
    free_stack_cluster_segments: Vec<VAddrRange>,
    free_lpids: BTreeSet<Lpid>,
    lpid_to_fingerprint: HashMap<Lpid, Fingerprint>,
    lpid_to_info: HashMap<Lpid, LpidInfo>,
    objs_map: HashMap<ProcletId, NodeAddr>,
    placement: Box<dyn PlacementPolicy>,
}

impl Controller {
    pub fn new() -> Controller {
        Controller::with_placement(Box::new(FirstFitPlacement))
    }

    pub fn with_placement(placement: Box<dyn PlacementPolicy>) -> Controller {
        let mut free_heap_segments = Vec::new();
        let mut addr = MIN_HEAP_VADDR;
        while addr + PROCLET_HEAP_SIZE <= MAX_HEAP_VADDR {
            free_heap_segments.push(VAddrRange {
                start: addr,
                end: addr + PROCLET_HEAP_SIZE,
            });
            addr += PROCLET_HEAP_SIZE;
        }
        // Pop order hands out low addresses first.
        free_heap_segments.reverse();

        let mut free_stack_cluster_segments = Vec::new();
        let mut addr = MIN_STACK_CLUSTER_VADDR;
        while addr + STACK_CLUSTER_SIZE <= MAX_STACK_CLUSTER_VADDR {
            free_stack_cluster_segments.push(VAddrRange {
                start: addr,
                end: addr + STACK_CLUSTER_SIZE,
            });
            addr += STACK_CLUSTER_SIZE;
        }
        free_stack_cluster_segments.reverse();

        let free_lpids = (1..=Lpid::MAX.min(1 << 16)).collect();

        Controller {
            free_heap_segments,
            free_stack_cluster_segments,
            free_lpids,
            lpid_to_fingerprint: HashMap::new(),
            lpid_to_info: HashMap::new(),
            objs_map: HashMap::new(),
            placement,
        }
    }

    /// Admits a node into a logical process. A zero hint allocates a fresh
    /// lpid; a non-zero hint joins, provided the build fingerprints match.
    /// Re-registering the same node with the same fingerprint is idempotent
    /// and returns the original stack cluster.
    pub fn register_node(
        &mut self,
        node: NodeSpec,
        lpid_hint: Lpid,
        fingerprint: Fingerprint,
    ) -> Option<RegisterInfo> {
        let lpid = if lpid_hint != 0 {
            if self.free_lpids.remove(&lpid_hint) {
                self.lpid_to_fingerprint.insert(lpid_hint, fingerprint);
            } else {
                match self.lpid_to_fingerprint.get(&lpid_hint) {
                    Some(expected) if *expected == fingerprint => {}
                    _ => {
                        warn!(
                            "node {} refused: fingerprint mismatch for lpid {}",
                            node.ip, lpid_hint
                        );
                        return None;
                    }
                }
            }
            lpid_hint
        } else {
            let lpid = *self.free_lpids.iter().next()?;
            self.free_lpids.remove(&lpid);
            self.lpid_to_fingerprint.insert(lpid, fingerprint);
            lpid
        };

        let info = self.lpid_to_info.entry(lpid).or_insert_with(|| LpidInfo {
            nodes: Vec::new(),
            cursor: 0,
            stack_clusters: HashMap::new(),
        });

        if let Some(existing) = info.stack_clusters.get(&node) {
            // Idempotent re-registration.
            return Some(RegisterInfo {
                lpid,
                stack_cluster: *existing,
                peers: info.nodes.iter().filter(|n| **n != node).copied().collect(),
            });
        }

        let stack_cluster = match self.free_stack_cluster_segments.pop() {
            Some(range) => range,
            None => {
                if info.nodes.is_empty() {
                    self.free_lpids.insert(lpid);
                    self.lpid_to_fingerprint.remove(&lpid);
                    self.lpid_to_info.remove(&lpid);
                }
                return None;
            }
        };

        let peers = info.nodes.clone();
        info.nodes.push(node);
        info.stack_clusters.insert(node, stack_cluster);
        info!(
            "registered node {} into lpid {} ({} members)",
            node.ip,
            lpid,
            info.nodes.len()
        );
        Some(RegisterInfo {
            lpid,
            stack_cluster,
            peers,
        })
    }

    /// Pops a free heap window and places the new proclet: on the hinted
    /// node if any (rejecting non-members), else round-robin.
    pub fn allocate_proclet(
        &mut self,
        lpid: Lpid,
        ip_hint: Option<u32>,
    ) -> Option<(ProcletId, NodeAddr)> {
        let info = self.lpid_to_info.get_mut(&lpid)?;
        if info.nodes.is_empty() {
            return None;
        }
        let node = match ip_hint {
            Some(ip) => *info.nodes.iter().find(|n| n.ip == ip)?,
            None => {
                let node = info.nodes[info.cursor % info.nodes.len()];
                info.cursor = info.cursor.wrapping_add(1);
                node
            }
        };

        let window = self.free_heap_segments.pop()?;
        let id = ProcletId(window.start);
        let addr = node.rpc_addr();
        self.objs_map.insert(id, addr);
        Some((id, addr))
    }

    /// Releases the heap window. Idempotent destruction would mean a
    /// double-free of the VA range, so an unknown id is only warned about.
    pub fn destroy_proclet(&mut self, id: ProcletId) -> bool {
        if self.objs_map.remove(&id).is_none() {
            warn!("destroy for unknown {}", id);
            return false;
        }
        self.free_heap_segments.push(VAddrRange {
            start: id.0,
            end: id.0 + PROCLET_HEAP_SIZE,
        });
        true
    }

    pub fn resolve_proclet(&self, id: ProcletId) -> Option<NodeAddr> {
        self.objs_map.get(&id).copied()
    }

    /// Migration cutover: future resolutions point at the new owner.
    pub fn update_location(&mut self, id: ProcletId, addr: NodeAddr) {
        if self.objs_map.insert(id, addr).is_none() {
            warn!("location update for unknown {}", id);
        }
    }

    pub fn get_migration_dest(
        &mut self,
        lpid: Lpid,
        requestor_ip: u32,
        resource: Resource,
    ) -> Option<NodeSpec> {
        let info = self.lpid_to_info.get(&lpid)?;
        self.placement.pick_dest(&info.nodes, requestor_ip, resource)
    }

    pub fn num_objs(&self) -> usize {
        self.objs_map.len()
    }

    pub fn num_free_heap_segments(&self) -> usize {
        self.free_heap_segments.len()
    }
}

impl Default for Controller {
    fn default() -> Controller {
        Controller::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: u32) -> NodeSpec {
        NodeSpec {
            ip,
            rpc_port: 9000,
            migrator_port: 9001,
        }
    }

    fn fp(b: u8) -> Fingerprint {
        [b; 16]
    }

    #[test]
    fn register_assigns_fresh_lpid_and_cluster() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        assert_ne!(info.lpid, 0);
        assert!(info.peers.is_empty());
        assert_eq!(info.stack_cluster.len(), STACK_CLUSTER_SIZE);

        let info2 = ctrl.register_node(node(2), info.lpid, fp(1)).unwrap();
        assert_eq!(info2.lpid, info.lpid);
        assert_eq!(info2.peers, vec![node(1)]);
        assert_ne!(info2.stack_cluster, info.stack_cluster);
    }

    #[test]
    fn fingerprint_mismatch_is_rejected() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        assert!(ctrl.register_node(node(2), info.lpid, fp(2)).is_none());
    }

    #[test]
    fn re_registration_is_idempotent() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        let free_before = ctrl.free_stack_cluster_segments.len();
        let again = ctrl.register_node(node(1), info.lpid, fp(1)).unwrap();
        assert_eq!(again.lpid, info.lpid);
        assert_eq!(again.stack_cluster, info.stack_cluster);
        assert_eq!(ctrl.free_stack_cluster_segments.len(), free_before);
    }

    #[test]
    fn allocate_then_destroy_restores_free_set() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        let free_before = ctrl.num_free_heap_segments();
        let (id, addr) = ctrl.allocate_proclet(info.lpid, None).unwrap();
        assert_eq!(addr, node(1).rpc_addr());
        assert_eq!(ctrl.resolve_proclet(id), Some(addr));
        assert!(ctrl.destroy_proclet(id));
        assert_eq!(ctrl.num_free_heap_segments(), free_before);
        assert_eq!(ctrl.resolve_proclet(id), None);
        assert_eq!(ctrl.num_objs(), 0);
    }

    #[test]
    fn round_robin_placement_cycles_members() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        ctrl.register_node(node(2), info.lpid, fp(1)).unwrap();
        let (_, a) = ctrl.allocate_proclet(info.lpid, None).unwrap();
        let (_, b) = ctrl.allocate_proclet(info.lpid, None).unwrap();
        assert_ne!(a.ip, b.ip);
    }

    #[test]
    fn ip_hint_rejects_non_members() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        assert!(ctrl.allocate_proclet(info.lpid, Some(99)).is_none());
        assert!(ctrl.allocate_proclet(info.lpid, Some(1)).is_some());
    }

    #[test]
    fn migration_dest_excludes_requestor() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        assert_eq!(
            ctrl.get_migration_dest(info.lpid, 1, Resource::default()),
            None,
            "single-node lpid has no destination"
        );
        ctrl.register_node(node(2), info.lpid, fp(1)).unwrap();
        let dest = ctrl
            .get_migration_dest(info.lpid, 1, Resource::default())
            .unwrap();
        assert_eq!(dest, node(2));
    }

    #[test]
    fn update_location_moves_resolution() {
        let mut ctrl = Controller::new();
        let info = ctrl.register_node(node(1), 0, fp(1)).unwrap();
        ctrl.register_node(node(2), info.lpid, fp(1)).unwrap();
        let (id, _) = ctrl.allocate_proclet(info.lpid, Some(1)).unwrap();
        ctrl.update_location(id, node(2).rpc_addr());
        assert_eq!(ctrl.resolve_proclet(id), Some(node(2).rpc_addr()));
    }
}
