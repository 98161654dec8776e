//! Error types for vcsm.

use thiserror::Error;

/// Result type alias using vcsm's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shared-memory operations.
///
/// Pure lookups (address/handle queries) never produce an error; they return
/// zero sentinels instead. Mutating operations report failures through this
/// enum at the dispatcher boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Handle or address has no matching registry entry.
    #[error("resource not found")]
    NotFound,

    /// Caller's process identity does not match the resource owner.
    #[error("permission denied: pid {caller} is not the owner (pid {owner})")]
    PermissionDenied {
        /// Pid of the calling process.
        caller: u32,
        /// Pid recorded as the resource owner.
        owner: u32,
    },

    /// Operation rejected because the resource is locked or mapped.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The remote service call itself failed (distinct from interrupted).
    #[error("remote service failure (status {status})")]
    Remote {
        /// Status code reported by the remote side.
        status: i32,
    },

    /// A remote call was interrupted by a signal.
    ///
    /// This is a restart request, not a true failure: the session records
    /// which action must be cleaned up before the operation is retried.
    #[error("remote call interrupted, restart the operation")]
    Interrupted,

    /// Remote or local memory exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// Malformed request parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Address range falls outside the resource bounds.
    #[error("address out of range")]
    OutOfRange,

    /// Page-fault servicing failed; the faulting access cannot be satisfied.
    #[error("bus error: faulted page could not be materialized")]
    BusError,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
