use crate::error::Evicted;
use crate::slab::SlabAllocator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::RwLock;

/// Every node of a logical process must register the same types and methods
/// in any order; the selector is a stable hash of the registered name, and
/// the table fingerprint exchanged at node registration refuses joins
/// between binaries whose tables disagree.
///
/// This replaces the original design's "function pointer as selector" trick,
/// which relied on identical code layout across the cluster.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

pub fn selector_of(name: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for b in name.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Root state of a proclet. Serializability is what lets the runtime move
/// the proclet between nodes without raw memory transfer.
pub trait ProcletState: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> ProcletState for T {}

type ConstructFn =
    Box<dyn Fn(&SlabAllocator, &[u8]) -> Result<u64, bincode::Error> + Send + Sync>;
type DestructFn = Box<dyn Fn(&SlabAllocator, u64) + Send + Sync>;
type SerializeFn = Box<dyn Fn(u64) -> Result<Vec<u8>, bincode::Error> + Send + Sync>;
type InvokeFn =
    Box<dyn Fn(u64, &[u8]) -> Result<Result<Vec<u8>, Evicted>, bincode::Error> + Send + Sync>;

struct TypeEntry {
    name: &'static str,
    type_id: TypeId,
    construct: ConstructFn,
    destruct: DestructFn,
    serialize: SerializeFn,
}

struct MethodEntry {
    name: &'static str,
    signature: (TypeId, TypeId, TypeId),
    invoke: InvokeFn,
}

#[derive(Default)]
struct Registry {
    types: HashMap<u64, TypeEntry>,
    methods: HashMap<u64, MethodEntry>,
    type_sel_by_id: HashMap<TypeId, u64>,
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::default());
}

/// Typed handle to a registered method, checked against the registry at
/// construction so a bad name or mismatched signature fails at lookup time
/// rather than on a remote node.
pub struct MethodRef<T, A, R> {
    selector: u64,
    name: &'static str,
    _marker: PhantomData<fn(&T, A) -> R>,
}

// PhantomData<fn(...)> keeps MethodRef Copy regardless of T/A/R.
impl<T, A, R> Copy for MethodRef<T, A, R> {}
impl<T, A, R> Clone for MethodRef<T, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A, R> MethodRef<T, A, R> {
    pub fn selector(&self) -> u64 {
        self.selector
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Registers `T` as a proclet root type. Idempotent for the same `T`;
/// re-using the name for a different type aborts, because the two binaries
/// involved could silently disagree about what the selector means.
pub fn register_type<T: ProcletState>(name: &'static str) -> u64 {
    let sel = selector_of(name);
    let mut reg = REGISTRY.write().unwrap();
    if let Some(existing) = reg.types.get(&sel) {
        bug_on!(
            existing.type_id != TypeId::of::<T>(),
            "type name {:?} registered twice with different types",
            name
        );
        return sel;
    }

    let entry = TypeEntry {
        name,
        type_id: TypeId::of::<T>(),
        construct: Box::new(|slab, bytes| {
            let state: T = bincode::deserialize(bytes)?;
            let p = slab.allocate(std::mem::size_of::<T>() as u64) as *mut T;
            bug_on!(p.is_null(), "proclet heap exhausted constructing root");
            unsafe { p.write(state) };
            Ok(p as u64)
        }),
        destruct: Box::new(|slab, addr| unsafe {
            std::ptr::drop_in_place(addr as *mut T);
            slab.free(addr as *mut u8);
        }),
        serialize: Box::new(|addr| {
            let state = unsafe { &*(addr as *const T) };
            bincode::serialize(state)
        }),
    };
    reg.types.insert(sel, entry);
    reg.type_sel_by_id.insert(TypeId::of::<T>(), sel);
    sel
}

/// Registers a method on a previously registered root type. Handlers take
/// the root by shared reference; mutable state inside the root goes through
/// the runtime's migration-aware `Mutex`.
pub fn register_method<T, A, R>(
    name: &'static str,
    f: fn(&T, A) -> Result<R, Evicted>,
) -> MethodRef<T, A, R>
where
    T: ProcletState,
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
{
    let sel = selector_of(name);
    let signature = (TypeId::of::<T>(), TypeId::of::<A>(), TypeId::of::<R>());
    let mut reg = REGISTRY.write().unwrap();
    if let Some(existing) = reg.methods.get(&sel) {
        bug_on!(
            existing.signature != signature,
            "method name {:?} registered twice with different signatures",
            name
        );
        return MethodRef {
            selector: sel,
            name,
            _marker: PhantomData,
        };
    }

    let entry = MethodEntry {
        name,
        signature,
        invoke: Box::new(move |root, args_bytes| {
            let args: A = bincode::deserialize(args_bytes)?;
            let obj = unsafe { &*(root as *const T) };
            match f(obj, args) {
                Ok(ret) => Ok(Ok(bincode::serialize(&ret)?)),
                Err(evicted) => Ok(Err(evicted)),
            }
        }),
    };
    reg.methods.insert(sel, entry);
    MethodRef {
        selector: sel,
        name,
        _marker: PhantomData,
    }
}

/// Looks up an already registered method by name, checking the signature.
pub fn method<T, A, R>(name: &'static str) -> MethodRef<T, A, R>
where
    T: ProcletState,
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
{
    let sel = selector_of(name);
    let reg = REGISTRY.read().unwrap();
    let entry = reg
        .methods
        .get(&sel)
        .unwrap_or_else(|| panic!("method {:?} is not registered", name));
    assert_eq!(
        entry.signature,
        (TypeId::of::<T>(), TypeId::of::<A>(), TypeId::of::<R>()),
        "method {:?} signature mismatch",
        name
    );
    MethodRef {
        selector: sel,
        name,
        _marker: PhantomData,
    }
}

pub fn type_sel_of<T: ProcletState>() -> u64 {
    let reg = REGISTRY.read().unwrap();
    *reg.type_sel_by_id
        .get(&TypeId::of::<T>())
        .unwrap_or_else(|| panic!("proclet type is not registered"))
}

pub(crate) fn construct_root(
    type_sel: u64,
    slab: &SlabAllocator,
    bytes: &[u8],
) -> Option<u64> {
    let reg = REGISTRY.read().unwrap();
    let entry = reg.types.get(&type_sel)?;
    (entry.construct)(slab, bytes).ok()
}

pub(crate) fn destruct_root(type_sel: u64, slab: &SlabAllocator, addr: u64) {
    let reg = REGISTRY.read().unwrap();
    if let Some(entry) = reg.types.get(&type_sel) {
        (entry.destruct)(slab, addr);
    }
}

pub(crate) fn serialize_root(type_sel: u64, addr: u64) -> Option<Vec<u8>> {
    let reg = REGISTRY.read().unwrap();
    let entry = reg.types.get(&type_sel)?;
    (entry.serialize)(addr).ok()
}

/// Runs a method shim against the root object. The outer error is a
/// serialization failure (protocol violation); the inner `Evicted` means
/// the handler unwound because its proclet began migrating.
pub(crate) fn invoke(
    selector: u64,
    root: u64,
    args: &[u8],
) -> Option<Result<Result<Vec<u8>, Evicted>, bincode::Error>> {
    let reg = REGISTRY.read().unwrap();
    let entry = reg.methods.get(&selector)?;
    Some((entry.invoke)(root, args))
}

/// 16-byte digest over the registered selector table; two nodes whose
/// digests differ must not join the same logical process.
pub fn fingerprint() -> crate::commons::Fingerprint {
    let reg = REGISTRY.read().unwrap();
    let mut names: Vec<(u64, &str, u8)> = reg
        .types
        .iter()
        .map(|(sel, t)| (*sel, t.name, 0u8))
        .chain(reg.methods.iter().map(|(sel, m)| (*sel, m.name, 1u8)))
        .collect();
    names.sort();
    let mut hasher = Sha256::new();
    for (sel, name, kind) in names {
        hasher.update(sel.to_le_bytes());
        hasher.update([kind]);
        hasher.update(name.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    fn get(c: &Counter, _: ()) -> Result<u64, Evicted> {
        Ok(c.value)
    }

    #[test]
    fn selector_is_stable() {
        assert_eq!(selector_of("abc"), selector_of("abc"));
        assert_ne!(selector_of("abc"), selector_of("abd"));
    }

    #[test]
    fn register_and_invoke_round_trip() {
        register_type::<Counter>("registry-test.counter");
        let m = register_method::<Counter, (), u64>("registry-test.counter.get", get);

        let mut buf = vec![0u8; 1 << 16];
        let addr = buf.as_mut_ptr() as usize;
        let aligned = (addr + 15) & !15;
        let slab =
            unsafe { SlabAllocator::new(9, aligned as *mut u8, (1 << 16) - 16) };

        let state = bincode::serialize(&Counter { value: 41 }).unwrap();
        let root = construct_root(type_sel_of::<Counter>(), &slab, &state).unwrap();
        let args = bincode::serialize(&()).unwrap();
        let ret = invoke(m.selector(), root, &args).unwrap().unwrap().unwrap();
        let value: u64 = bincode::deserialize(&ret).unwrap();
        assert_eq!(value, 41);

        let reserialized = serialize_root(type_sel_of::<Counter>(), root).unwrap();
        assert_eq!(reserialized, state);
        destruct_root(type_sel_of::<Counter>(), &slab, root);
    }

    #[test]
    fn registration_is_idempotent_and_fingerprint_stable() {
        register_type::<Counter>("registry-test.counter");
        register_method::<Counter, (), u64>("registry-test.counter.get", get);
        let f1 = fingerprint();
        register_type::<Counter>("registry-test.counter");
        let f2 = fingerprint();
        assert_eq!(f1, f2);
    }

    #[test]
    fn lookup_validates_signature() {
        register_type::<Counter>("registry-test.counter");
        register_method::<Counter, (), u64>("registry-test.counter.get", get);
        let m = method::<Counter, (), u64>("registry-test.counter.get");
        assert_eq!(m.selector(), selector_of("registry-test.counter.get"));
    }
}
