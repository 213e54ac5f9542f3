use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Cluster-wide virtual-address layout. Every node reserves proclet heap
/// windows and stack clusters from the same ranges, so a pointer into a
/// proclet heap stays valid after the proclet moves to another node.
pub const PROCLET_HEAP_SIZE: u64 = 1 << 30;
pub const MIN_HEAP_VADDR: u64 = 0x4000_0000_0000;
pub const MAX_HEAP_VADDR: u64 = 0x5000_0000_0000;

pub const STACK_CLUSTER_SIZE: u64 = 1 << 30;
pub const MIN_STACK_CLUSTER_VADDR: u64 = 0x6000_0000_0000;
pub const MAX_STACK_CLUSTER_VADDR: u64 = 0x6040_0000_0000;

/// The runtime heap is a per-process window for internal metadata; it is not
/// cluster-unique and never migrates.
pub const RUNTIME_HEAP_VADDR: u64 = 0x7000_0000_0000;
pub const RUNTIME_HEAP_SIZE: u64 = 8 << 30;

/// Dispatch-thread stacks must satisfy the libc minimum plus TLS overhead,
/// which is why this is far larger than a green-thread stack would be.
pub const STACK_SIZE: usize = 1 << 20;

pub const CACHE_LINE_BYTES: usize = 64;

/// Number of per-core cache slots used by the slab, the stack allocator, the
/// RCU reader counters, and the connection manager. Indexed by
/// `cpu_slot()`, so machines with more cores simply share slots.
pub const NUM_CPU_SLOTS: usize = 64;

pub type Lpid = u32;

/// 16-byte build fingerprint exchanged at node registration. Nodes whose
/// selector tables disagree must not join the same logical process.
pub type Fingerprint = [u8; 16];

/// A proclet is identified by the base address of its 1 GiB heap window.
/// IDs are cluster-unique, never reused while the proclet is alive, and
/// stable across migrations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcletId(pub u64);

impl ProcletId {
    pub const NULL: ProcletId = ProcletId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn heap_base(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn from_heap_base(base: *mut u8) -> ProcletId {
        ProcletId(base as u64)
    }
}

impl fmt::Display for ProcletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proclet:{:#x}", self.0)
    }
}

impl fmt::Debug for ProcletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// (ip, port) pair in the fixed-width form the wire protocol carries.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: u32,
    pub port: u16,
}

impl NodeAddr {
    pub const NONE: NodeAddr = NodeAddr { ip: 0, port: 0 };

    pub fn new(ip: Ipv4Addr, port: u16) -> NodeAddr {
        NodeAddr {
            ip: u32::from(ip),
            port,
        }
    }

    pub fn is_none(self) -> bool {
        self.ip == 0 && self.port == 0
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> NodeAddr {
        match addr {
            SocketAddr::V4(v4) => NodeAddr::new(*v4.ip(), v4.port()),
            SocketAddr::V6(_) => NodeAddr::NONE,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.ip), self.port)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Amount of resource a migration is asked to relieve, or a proclet is
/// expected to occupy at a destination.
#[derive(Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Resource {
    pub cores: u32,
    pub mem_mbs: u32,
}

impl Resource {
    pub fn is_empty(self) -> bool {
        self.cores == 0 && self.mem_mbs == 0
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VAddrRange {
    pub start: u64,
    pub end: u64,
}

impl VAddrRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Pads a value out to its own cache line so per-core slots do not false
/// share.
#[repr(align(64))]
#[derive(Default)]
pub struct CachePadded<T>(pub T);

/// Which per-core cache slot the calling thread should use. The result is
/// only a locality hint; slots are individually locked.
pub fn cpu_slot() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize % NUM_CPU_SLOTS
    }
}

/// Cycle counter used for CPU-load charging.
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// Maps `len` bytes of anonymous memory at exactly `addr`. Used for proclet
/// heap windows and stack clusters, whose addresses are assigned by the
/// controller out of the cluster-wide layout; MAP_NORESERVE keeps a mostly
/// empty 1 GiB window cheap.
pub fn mmap_fixed(addr: u64, len: u64) -> nix::Result<*mut u8> {
    use nix::sys::mman::{mmap, MapFlags, ProtFlags};
    let p = unsafe {
        mmap(
            addr as *mut libc::c_void,
            len as usize,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_ANONYMOUS
                | MapFlags::MAP_PRIVATE
                | MapFlags::MAP_FIXED
                | MapFlags::MAP_NORESERVE,
            -1,
            0,
        )?
    };
    debug_assert_eq!(p as u64, addr);
    Ok(p as *mut u8)
}

pub fn munmap_fixed(addr: u64, len: u64) -> nix::Result<()> {
    unsafe { nix::sys::mman::munmap(addr as *mut libc::c_void, len as usize) }
}

/// Monotonic microseconds since process start.
pub fn microtime() -> u64 {
    lazy_static! {
        static ref EPOCH: std::time::Instant = std::time::Instant::now();
    }
    EPOCH.elapsed().as_micros() as u64
}
