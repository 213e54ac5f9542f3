use std::fmt;
use std::io;

/// Aborts the process with a diagnostic. Used for the unrecoverable error
/// classes: protocol violations, slab sentinel mismatches, and migration
/// failures once heap bytes are on the wire.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        log::error!("BUG at {}:{}: {}", file!(), line!(), format_args!($($arg)*));
        std::process::abort();
    }};
}

#[macro_export]
macro_rules! bug_on {
    ($cond:expr) => {{
        if $cond {
            $crate::bug!("condition `{}` holds", stringify!($cond));
        }
    }};
    ($cond:expr, $($arg:tt)*) => {{
        if $cond {
            $crate::bug!($($arg)*);
        }
    }};
}

/// Returned by a suspension point (mutex, condvar, sleep) inside a proclet
/// whose migration began while the thread was parked. The handler unwinds
/// without touching proclet state; the dispatcher answers the caller with
/// `FORWARDED` and the call is re-issued at the destination.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Evicted;

impl fmt::Display for Evicted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evicted by proclet migration")
    }
}

impl std::error::Error for Evicted {}

/// Non-fatal errors that cross module boundaries. Transient ownership codes
/// (`FORWARDED`, `CLIENT_RETRY`) never appear here; they are consumed by the
/// RPC client's retry loop.
#[derive(Debug)]
pub enum Error {
    /// Unparsable config or an unusable bootstrap parameter.
    Config(String),
    /// The controller rejected a request (md5 mismatch, unknown lpid, ...).
    Rejected(&'static str),
    /// A TCP-level failure talking to a peer; the affected connection has
    /// been dropped from its pool.
    Transport(io::Error),
    /// No free heap window / lpid / migration destination. The caller
    /// decides what to do; `make_proclet` surfaces this as `None`.
    Exhausted(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "config error: {}", msg),
            Error::Rejected(what) => write!(f, "rejected by controller: {}", what),
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::Exhausted(what) => write!(f, "resource exhausted: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
