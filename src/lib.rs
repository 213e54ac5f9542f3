//! drift: a distributed userspace runtime that executes applications as
//! fleets of fine-grained, migratable compute units ("proclets").
//!
//! A proclet is a self-contained object with its own heap window, dispatch
//! threads, and synchronization state. The runtime transparently routes
//! method calls to whichever node currently hosts the proclet, and may
//! relocate any proclet between nodes under memory or CPU pressure without
//! application cooperation.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod error;

pub mod commons;
pub mod config;
pub mod ctrl;
pub mod future;
pub mod migrator;
pub mod monitor;
pub mod pressure;
pub mod proclet;
pub mod rcu;
pub mod registry;
pub mod rem;
pub mod rpc;
pub mod runtime;
pub mod server;
pub mod slab;
pub mod stack;
pub mod sync;
pub mod uthread;

pub mod commands;

pub use crate::commons::{NodeAddr, ProcletId, Resource};
pub use crate::error::Evicted;
pub use crate::future::{promise, Future, Promise};
pub use crate::registry::{method, register_method, register_type, MethodRef, ProcletState};
pub use crate::rem::{attach, MethodResult, RemPtr, RemSharedPtr, RemUniquePtr};
pub use crate::runtime::{Runtime, RuntimeMode};
pub use crate::sync::condvar::CondVar;
pub use crate::sync::mutex::{Mutex, MutexGuard};
pub use crate::sync::time::Time;
