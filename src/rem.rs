use crate::commons::ProcletId;
use crate::error::Evicted;
use crate::future::{promise, Future};
use crate::registry::{MethodRef, ProcletState};
use crate::rpc::ProcletRequest;
use crate::runtime;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

fn run_remote<T, A, R>(id: ProcletId, m: &MethodRef<T, A, R>, args: A) -> R
where
    T: ProcletState,
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
{
    let rt = runtime::current();
    let args_bytes = bincode::serialize(&args).expect("serialize call arguments");
    let payload = rt
        .caller()
        .call(
            id,
            &ProcletRequest::Invoke {
                id,
                selector: m.selector(),
                args: &args_bytes,
            },
        )
        .unwrap_or_else(|e| bug!("call {} on {} failed: {}", m.name(), id, e));
    bincode::deserialize(&payload)
        .unwrap_or_else(|e| bug!("decode reply of {} from {}: {}", m.name(), id, e))
}

fn send_ref_cnt(id: ProcletId, req: ProcletRequest<'_>) {
    let rt = match runtime::try_current() {
        Some(rt) => rt,
        // Handles dropped after runtime tear-down have nothing to talk to.
        None => return,
    };
    if let Err(err) = rt.caller().call(id, &req) {
        debug!("refcount update for {} failed: {}", id, err);
    }
}

/// Weak, copyable value handle: an id plus the in-proclet address of the
/// pointee. Carries no refcount; the referent must be kept alive by a
/// unique or shared handle elsewhere. This is the form back-edges take.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RemPtr<T> {
    id: ProcletId,
    raw: u64,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for RemPtr<T> {}
impl<T> Clone for RemPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ProcletState> RemPtr<T> {
    pub fn id(&self) -> ProcletId {
        self.id
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Dispatches `m` to the proclet wherever it currently lives and
    /// blocks for the result.
    pub fn run<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> R
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        run_remote(self.id, m, args)
    }

    /// Fire-and-collect variant; the reply wakes the future.
    pub fn run_async<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> Future<R>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let (p, f) = promise();
        let this = *self;
        let m = *m;
        let rt = runtime::current();
        std::thread::Builder::new()
            .name("drift-async-call".into())
            .spawn(move || {
                let _g = rt.enter();
                p.set(this.run(&m, args));
            })
            .expect("spawn async call");
        f
    }
}

/// Sole handle to a proclet, in the manner of a unique pointer: not
/// clonable, does not bump the refcount (construction left it at one), and
/// destroys the proclet on drop.
pub struct RemUniquePtr<T> {
    ptr: RemPtr<T>,
}

impl<T: ProcletState> RemUniquePtr<T> {
    /// # Safety
    /// `raw` must be the root address returned by the construct RPC for
    /// `id`.
    pub unsafe fn from_raw(id: ProcletId, raw: u64) -> RemUniquePtr<T> {
        RemUniquePtr {
            ptr: RemPtr {
                id,
                raw,
                _marker: PhantomData,
            },
        }
    }

    pub fn id(&self) -> ProcletId {
        self.ptr.id
    }

    pub fn run<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> R
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        self.ptr.run(m, args)
    }

    pub fn run_async<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> Future<R>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.ptr.run_async(m, args)
    }

    /// Demotes to a weak value handle (no lifetime implications).
    pub fn weak(&self) -> RemPtr<T> {
        self.ptr
    }

    /// Converts the sole handle into a counted shared handle.
    pub fn into_shared(self) -> RemSharedPtr<T> {
        let ptr = self.ptr;
        std::mem::forget(self);
        RemSharedPtr { ptr }
    }
}

impl<T> Drop for RemUniquePtr<T> {
    fn drop(&mut self) {
        let id = self.ptr.id;
        send_ref_cnt(id, ProcletRequest::Destruct { id });
    }
}

/// Counted shared handle: clone sends `+1` to the owner proclet, drop
/// sends `-1`; the proclet dies when the count reaches zero. Serializing a
/// shared handle (moving it into call arguments) does not touch the count,
/// so the sender must outlive the call, which Rust's borrows enforce for
/// by-reference callers.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RemSharedPtr<T> {
    ptr: RemPtr<T>,
}

impl<T: ProcletState> RemSharedPtr<T> {
    pub fn id(&self) -> ProcletId {
        self.ptr.id
    }

    pub fn run<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> R
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        self.ptr.run(m, args)
    }

    pub fn run_async<A, R>(&self, m: &MethodRef<T, A, R>, args: A) -> Future<R>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        self.ptr.run_async(m, args)
    }

    pub fn weak(&self) -> RemPtr<T> {
        self.ptr
    }
}

impl<T: ProcletState> Clone for RemSharedPtr<T> {
    fn clone(&self) -> Self {
        let id = self.ptr.id;
        send_ref_cnt(id, ProcletRequest::UpdateRefCnt { id, delta: 1 });
        RemSharedPtr { ptr: self.ptr }
    }
}

impl<T> Drop for RemSharedPtr<T> {
    fn drop(&mut self) {
        let id = self.ptr.id;
        send_ref_cnt(id, ProcletRequest::UpdateRefCnt { id, delta: -1 });
    }
}

/// Rebinds to an existing proclet by id, taking a counted reference. The
/// address of the root is recovered from the owner.
pub fn attach<T: ProcletState>(id: ProcletId) -> Option<RemSharedPtr<T>> {
    let rt = runtime::current();
    rt.caller()
        .call(id, &ProcletRequest::UpdateRefCnt { id, delta: 1 })
        .ok()?;
    Some(RemSharedPtr {
        ptr: RemPtr {
            id,
            raw: 0,
            _marker: PhantomData,
        },
    })
}

/// Argument-side view of an `Evicted` propagating handler; re-exported so
/// application handlers can spell their return type tersely.
pub type MethodResult<R> = Result<R, Evicted>;
