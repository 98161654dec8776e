//! Integration tests for the resource lifecycle.
//!
//! These tests drive the manager end to end over the loopback service:
//! allocation, sharing, import, resize and free, plus the query surface.

use rustix::fd::OwnedFd;
use std::sync::Arc;
use vcsm::manager::{AllocParams, ManagerConfig, SharedMemoryManager};
use vcsm::prelude::*;
use vcsm::stats::OpKind;
use vcsm::types::PAGE_SIZE;

fn setup() -> (
    Arc<SharedMemoryManager>,
    LoopbackService,
    SimAddressSpace,
    RecordingCache,
) {
    let remote = LoopbackService::new();
    let vspace = SimAddressSpace::new();
    let cache = RecordingCache::new();
    let manager = SharedMemoryManager::new(
        Arc::new(remote.clone()),
        Arc::new(vspace.clone()),
        Arc::new(cache.clone()),
        ManagerConfig::default(),
    );
    (Arc::new(manager), remote, vspace, cache)
}

fn memfd(name: &str, size: u64) -> OwnedFd {
    let fd = rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, size).unwrap();
    fd
}

// ============================================================================
// Alloc / Free
// ============================================================================

/// Alloc returns a page-aligned handle, queries see the size, free removes it.
#[test]
fn test_alloc_query_free() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    assert!(!handle.is_none());
    assert_eq!(handle.0 % PAGE_SIZE as u32, 0);
    assert_eq!(manager.size_of(session, handle), 4096);
    assert_eq!(remote.live_allocations(), 1);

    manager.free(session, handle).unwrap();
    assert_eq!(manager.size_of(session, handle), 0);
    assert!(manager.check(session, handle).is_none());
    assert_eq!(remote.live_allocations(), 0);
}

/// Zero-size allocations are rejected before any remote call.
#[test]
fn test_alloc_zero_size_rejected() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));

    assert!(matches!(
        manager.alloc(session, AllocParams::new(0)),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(remote.live_allocations(), 0);
}

/// Sub-page sizes are rounded up before the remote allocation.
#[test]
fn test_alloc_size_is_page_aligned() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(100)).unwrap();
    assert_eq!(manager.size_of(session, handle), PAGE_SIZE as u32);
}

/// A failed remote allocation surfaces as out-of-memory and leaves nothing
/// behind.
#[test]
fn test_alloc_remote_failure_is_oom() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));

    remote.fail_next(vcsm::remote::RemoteAction::Alloc, -12);
    assert!(matches!(
        manager.alloc(session, AllocParams::new(4096)),
        Err(Error::OutOfMemory)
    ));
    assert!(manager.resources().is_empty());
}

/// Freeing an unknown handle is not-found; freeing twice reports not-found
/// the second time.
#[test]
fn test_free_unknown_handle() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    assert!(matches!(
        manager.free(session, Handle(0x5000)),
        Err(Error::NotFound)
    ));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    manager.free(session, handle).unwrap();
    assert!(matches!(
        manager.free(session, handle),
        Err(Error::NotFound)
    ));
}

// ============================================================================
// Sharing
// ============================================================================

/// A share aliases the target's backing memory and keeps it alive past the
/// creator's free; the backing allocation dies with the last holder.
#[test]
fn test_share_keeps_backing_alive() {
    let (manager, remote, _, _) = setup();
    let session_a = manager.open_session(Pid(100));
    let session_b = manager.open_session(Pid(200));

    let original = manager.alloc(session_a, AllocParams::new(8192)).unwrap();
    let (dup, size) = manager.alloc_share(session_b, original).unwrap();
    assert_eq!(size, 8192);
    assert_eq!(manager.size_of(session_b, dup), 8192);
    assert_eq!(
        manager.remote_handle_of(session_a, original),
        manager.remote_handle_of(session_b, dup)
    );
    assert_eq!(remote.live_allocations(), 1);

    // The creator frees; B's handle stays usable.
    manager.free(session_a, original).unwrap();
    assert_eq!(manager.size_of(session_b, dup), 8192);
    assert_eq!(remote.live_allocations(), 1);

    // The last holder's free destroys the backing allocation.
    manager.free(session_b, dup).unwrap();
    assert_eq!(remote.live_allocations(), 0);
    assert!(manager.resources().is_empty());
}

/// Sharing an unknown handle fails without creating anything.
#[test]
fn test_share_unknown_target() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    assert!(matches!(
        manager.alloc_share(session, Handle(0x1000)),
        Err(Error::NotFound)
    ));
    assert!(manager.resources().is_empty());
}

// ============================================================================
// Resize
// ============================================================================

/// Resize succeeds when unlocked and unmapped, returning the previous size.
#[test]
fn test_resize_roundtrip() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    let old = manager.resize(session, handle, 8192).unwrap();
    assert_eq!(old, 4096);
    assert_eq!(manager.size_of(session, handle), 8192);
}

/// Resize is rejected while the resource is locked, leaving the size alone.
#[test]
fn test_resize_rejected_while_locked() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    manager.lock(session, handle).unwrap();
    assert!(matches!(
        manager.resize(session, handle, 8192),
        Err(Error::Busy(_))
    ));
    assert_eq!(manager.size_of(session, handle), 4096);
}

/// Resize is rejected while mappings exist.
#[test]
fn test_resize_rejected_while_mapped() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    manager.map(session, handle, 0x10_0000, 4096).unwrap();
    assert!(matches!(
        manager.resize(session, handle, 8192),
        Err(Error::Busy(_))
    ));
    assert_eq!(manager.size_of(session, handle), 4096);
}

// ============================================================================
// Import
// ============================================================================

/// An imported buffer becomes a resource and its fd is held until the free.
#[test]
fn test_import_lifecycle() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let buffer = ExternalBuffer::attach(
        memfd("imported", 4096),
        &[BusSegment {
            addr: 0x3000_0000,
            len: 4096,
        }],
    )
    .unwrap();
    let handle = manager.import(session, buffer, CachePolicy::Host, "camera").unwrap();

    assert_eq!(manager.size_of(session, handle), 4096);
    assert_eq!(remote.live_allocations(), 1);

    manager.free(session, handle).unwrap();
    assert_eq!(remote.live_allocations(), 0);
}

/// A failed remote import drops the buffer attachment and reports
/// out-of-memory.
#[test]
fn test_import_remote_failure_unwinds() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let buffer = ExternalBuffer::attach(
        memfd("imported_fail", 4096),
        &[BusSegment {
            addr: 0x3000_0000,
            len: 4096,
        }],
    )
    .unwrap();
    remote.fail_next(vcsm::remote::RemoteAction::Import, -5);
    assert!(matches!(
        manager.import(session, buffer, CachePolicy::None, "doomed"),
        Err(Error::OutOfMemory)
    ));
    assert!(manager.resources().is_empty());
}

// ============================================================================
// Queries
// ============================================================================

/// Address and handle queries return null sentinels on a miss, never errors.
#[test]
fn test_queries_return_sentinels() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    assert!(manager.handle_from_address(Pid(100), 0x4000).is_none());
    assert!(manager.remote_handle_from_address(Pid(100), 0x4000).is_none());
    assert!(manager.remote_handle_of(session, Handle(0x9000)).is_none());
    assert_eq!(manager.vc_address_of(session, Handle(0x9000)), 0);
    assert_eq!(manager.host_address_of(session, Handle(0x9000)), 0);
}

/// Mapped resources answer the reverse lookups by pid and address.
#[test]
fn test_queries_after_mapping() {
    let (manager, _, _, _) = setup();
    let pid = Pid(100);
    let session = manager.open_session(pid);

    let handle = manager.alloc(session, AllocParams::new(8192)).unwrap();
    manager.map(session, handle, 0x20_0000, 8192).unwrap();

    assert_eq!(manager.handle_from_address(pid, 0x20_1000), handle);
    assert_eq!(
        manager.remote_handle_from_address(pid, 0x20_0000),
        manager.remote_handle_of(session, handle)
    );
    assert_eq!(manager.host_address_of(session, handle), 0x20_0000);
    assert_ne!(manager.vc_address_of(session, handle), 0);
}

// ============================================================================
// Statistics
// ============================================================================

/// A freed resource's counters roll into the deceased accumulator.
#[test]
fn test_stats_rollup_on_free() {
    let (manager, _, _, _) = setup();
    let session = manager.open_session(Pid(100));

    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();
    manager.lock(session, handle).unwrap();
    manager.unlock(session, handle, UnlockOptions::default()).unwrap();
    manager.free(session, handle).unwrap();

    let stats = manager.statistics();
    assert_eq!(stats.deceased.occurrences, 1);
    assert_eq!(stats.terminated.occurrences, 0);
    assert_eq!(stats.deceased.stats.attempts(OpKind::Alloc), 1);
    assert_eq!(stats.deceased.stats.attempts(OpKind::Lock), 1);
    assert_eq!(stats.deceased.stats.attempts(OpKind::Unlock), 1);
    assert_eq!(stats.deceased.stats.attempts(OpKind::Free), 1);
}
