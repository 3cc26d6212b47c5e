//! Session pool.
//!
//! Sessions are created and preloaded once, then leased to one task at a
//! time. A lease must end healthy (session goes back to the available set)
//! or broken (session goes to the repair loop and is never reissued).

mod lease;
mod session_pool;

pub use lease::{ReleaseOutcome, SessionLease};
pub use session_pool::{
    PoolError, PoolSnapshot, PreloadFailure, PreloadReport, SessionPool, SessionSnapshot,
};
