//! # vcsm
//!
//! A host-side shared-memory manager brokering coprocessor-visible
//! allocations between a host processor and an auxiliary coprocessor.
//!
//! The manager tracks every allocation as a reference-counted resource,
//! groups resources into per-client sessions, maintains a table of host
//! address-space mappings, and coordinates lock/unlock, cache maintenance
//! and fault-driven lazy mapping against a remote memory service.
//!
//! ## Features
//!
//! - **Resource lifecycle**: alloc, share (aliasing), import of host-owned
//!   DMA-BUF style buffers, resize, free, forced teardown at session close
//! - **Lock-on-fault mapping**: resources are locked lazily when first
//!   touched and their page frames installed one fault at a time
//! - **Cache maintenance**: flush/invalidate walks over resident pages,
//!   batched operations, pinned 2D block layouts
//! - **Restartable remote calls**: a signal-interrupted coprocessor exchange
//!   is parked on the session and cleaned up before the next operation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vcsm::prelude::*;
//! use std::sync::Arc;
//!
//! let remote = LoopbackService::new();
//! let vspace = SimAddressSpace::new();
//! let cache = RecordingCache::new();
//! let manager = SharedMemoryManager::new(
//!     Arc::new(remote),
//!     Arc::new(vspace),
//!     Arc::new(cache),
//!     ManagerConfig::default(),
//! );
//!
//! let session = manager.open_session(Pid(1234));
//! let handle = manager.alloc(session, AllocParams::new(4096))?;
//! let vc_addr = manager.lock(session, handle)?;
//! manager.unlock(session, handle, UnlockOptions::default())?;
//! manager.free(session, handle)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod error;
pub mod import;
pub mod manager;
mod mapping;
mod registry;
pub mod remote;
pub mod report;
mod session;
pub mod stats;
pub mod types;
pub mod vspace;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheOp, CachePrimitives, RecordingCache};
    pub use crate::error::{Error, Result};
    pub use crate::import::{BusSegment, ExternalBuffer};
    pub use crate::manager::{
        AllocParams, ManagerConfig, SharedMemoryManager, UnlockOptions,
    };
    pub use crate::remote::{LoopbackService, SharedMemoryService};
    pub use crate::types::{CachePolicy, Handle, Pid, SessionId, VcAddress};
    pub use crate::vspace::{AddressSpace, SimAddressSpace};
}

pub use error::{Error, Result};
