//! Integration tests for session teardown and concurrent use.

use std::sync::Arc;
use std::thread;
use vcsm::manager::{AllocParams, ManagerConfig, SharedMemoryManager, UnlockOptions};
use vcsm::prelude::*;
use vcsm::remote::RemoteAction;

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

// ============================================================================
// Teardown
// ============================================================================

/// Closing a session destroys everything it owned, even locked and mapped
/// resources.
#[test]
fn test_close_drains_session() {
    let (manager, remote, vspace, _) = setup();
    let pid = Pid(100);
    let session = manager.open_session(pid);

    let plain = manager.alloc(session, AllocParams::new(4096)).unwrap();
    let locked = manager.alloc(session, AllocParams::new(4096)).unwrap();
    let mapped = manager.alloc(session, AllocParams::new(8192)).unwrap();
    manager.lock(session, locked).unwrap();
    manager.map(session, mapped, 0x10_0000, 8192).unwrap();
    manager.fault(pid, 0x10_0000).unwrap();
    let _ = plain;

    manager.close_session(session).unwrap();

    assert!(manager.resources().is_empty());
    assert!(manager.mappings(None).is_empty());
    assert_eq!(remote.live_allocations(), 0);
    assert!(!vspace.is_mapped(pid, 0x10_0000));
    assert_eq!(manager.statistics().terminated.occurrences, 3);

    // The session itself is gone.
    assert!(matches!(
        manager.alloc(session, AllocParams::new(4096)),
        Err(Error::NotFound)
    ));
}

/// A share held by another session survives the owning session's close.
#[test]
fn test_close_spares_foreign_shares() {
    let (manager, remote, _, _) = setup();
    let session_a = manager.open_session(Pid(100));
    let session_b = manager.open_session(Pid(200));

    let original = manager.alloc(session_a, AllocParams::new(4096)).unwrap();
    let (dup, _) = manager.alloc_share(session_b, original).unwrap();

    manager.close_session(session_a).unwrap();
    // A's resource is gone but the backing allocation lives on through B.
    assert_eq!(manager.size_of(session_b, dup), 4096);
    assert_eq!(remote.live_allocations(), 1);

    manager.free(session_b, dup).unwrap();
    assert_eq!(remote.live_allocations(), 0);
}

/// A pending interrupted exchange is cleaned up before teardown starts.
#[test]
fn test_close_cleans_pending_interrupt() {
    let (manager, remote, _, _) = setup();
    let session = manager.open_session(Pid(100));
    let handle = manager.alloc(session, AllocParams::new(4096)).unwrap();

    remote.interrupt_next(RemoteAction::Lock);
    assert!(matches!(
        manager.lock(session, handle),
        Err(Error::Interrupted)
    ));

    manager.close_session(session).unwrap();
    let cleanups = remote.cleanups();
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].0, RemoteAction::Lock);
    assert_eq!(remote.live_allocations(), 0);
}

/// Closing an unknown session reports not-found.
#[test]
fn test_close_unknown_session() {
    let (manager, _, _, _) = setup();
    assert!(matches!(
        manager.close_session(SessionId(99)),
        Err(Error::NotFound)
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

/// Concurrent sessions hammering the full lifecycle leave no residue.
#[test]
fn test_concurrent_sessions() {
    let (manager, remote, _, _) = setup();
    let mut handles = Vec::new();

    for t in 0..4u32 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            let session = manager.open_session(Pid(1000 + t));
            for i in 0..50u32 {
                let h = manager
                    .alloc(session, AllocParams::new(4096 * (1 + i % 4)))
                    .unwrap();
                manager.lock(session, h).unwrap();
                manager.unlock(session, h, UnlockOptions::default()).unwrap();
                manager.free(session, h).unwrap();
            }
            manager.close_session(session).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(manager.resources().is_empty());
    assert_eq!(remote.live_allocations(), 0);
    assert_eq!(manager.statistics().deceased.occurrences, 200);
}

/// Shares taken concurrently against one target never double-free the
/// backing allocation.
#[test]
fn test_concurrent_sharing() {
    let (manager, remote, _, _) = setup();
    let owner = manager.open_session(Pid(100));
    let target = manager.alloc(owner, AllocParams::new(4096)).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || {
            let session = manager.open_session(Pid(2000 + t));
            for _ in 0..25 {
                let (dup, size) = manager.alloc_share(session, target).unwrap();
                assert_eq!(size, 4096);
                manager.free(session, dup).unwrap();
            }
            manager.close_session(session).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(remote.live_allocations(), 1);
    manager.free(owner, target).unwrap();
    assert_eq!(remote.live_allocations(), 0);
}

// ============================================================================
// Reporting
// ============================================================================

/// Resource and mapping snapshots reflect live state.
#[test]
fn test_report_snapshots() {
    let (manager, _, _, _) = setup();
    let pid = Pid(100);
    let session = manager.open_session(pid);
    let handle = manager.alloc(session, AllocParams::new(8192)).unwrap();
    manager.lock(session, handle).unwrap();
    manager.map(session, handle, 0x20_0000, 8192).unwrap();

    let resources = manager.resources();
    assert_eq!(resources.len(), 1);
    let r = &resources[0];
    assert_eq!(r.handle, handle);
    assert_eq!(r.owner, pid);
    assert_eq!(r.lock_count, 1);
    assert_eq!(r.map_count, 1);
    assert_eq!(r.ref_count, 1);

    let mappings = manager.mappings(Some(pid));
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].addr, 0x20_0000);
    assert!(manager.mappings(Some(Pid(999))).is_empty());

    // The host walk only logs; it must not disturb anything.
    manager.walk_mappings(None);
    assert_eq!(manager.mappings(None).len(), 1);
}
