//! Resource registry and reference-counted lifetime tracking.
//!
//! Every shared-memory block is represented by a [`Resource`] carrying two
//! independent counters: `ref_count` tracks who may still reach the resource
//! (the creating session holds one reference from creation until free; every
//! in-flight operation holds one more while it works outside the registry
//! lock), and `lock_count` tracks host-access locks. A resource is destroyed
//! when its last reference drops, or unconditionally when a forced release
//! tears a session down.
//!
//! Destruction has side effects that must not run under the registry lock
//! (host unmaps, the remote free, dropping an imported buffer), so
//! [`State::release`] only unlinks and returns a [`ReleaseAction`] describing
//! the work; the manager executes it after unlocking.

use crate::import::ExternalBuffer;
use crate::mapping::Mapping;
use crate::session::Session;
use crate::stats::{GlobalStats, OpStats};
use crate::types::{CachePolicy, Handle, MapId, Pid, RemoteHandle, SessionId, VcAddress};
use std::collections::HashMap;

/// A tracked shared-memory resource.
#[derive(Debug)]
pub(crate) struct Resource {
    /// Registry-wide unique handle, also the token handed to callers.
    pub handle: Handle,
    /// Session the resource belongs to.
    pub session: SessionId,
    /// Process that created it. Resize and share are owner-only.
    pub owner: Pid,
    /// Debug name carried to the remote side.
    pub name: String,
    /// Caching applied to host mappings.
    pub cache: CachePolicy,
    /// Requested size in bytes.
    pub size: u32,
    /// Remote identifier, [`RemoteHandle::NONE`] once disowned to a share.
    pub remote: RemoteHandle,
    /// Last known coprocessor-window address. Zero until first locked.
    pub base_addr: VcAddress,
    /// Outstanding references.
    pub ref_count: u32,
    /// Outstanding host-access locks.
    pub lock_count: u32,
    /// Host mappings of this resource.
    pub map_ids: Vec<MapId>,
    /// Kernel window mapped over the resource while locked with no process
    /// mapping. `(virtual address, length)`.
    pub kernel_window: Option<(usize, usize)>,
    /// Pre-fault the whole range when the resource is mapped.
    pub eager_map: bool,
    /// Handle of the resource this one was shared from, if any. Holds one
    /// reference on it until this resource dies.
    pub shared_from: Option<Handle>,
    /// Backing buffer of an imported resource.
    pub external: Option<ExternalBuffer>,
    /// Per-resource operation counters.
    pub stats: OpStats,
}

impl Resource {
    pub(crate) fn new(
        handle: Handle,
        session: SessionId,
        owner: Pid,
        name: String,
        cache: CachePolicy,
        size: u32,
    ) -> Self {
        Self {
            handle,
            session,
            owner,
            name,
            cache,
            size,
            remote: RemoteHandle::NONE,
            base_addr: 0,
            // The creation reference.
            ref_count: 1,
            lock_count: 0,
            map_ids: Vec::new(),
            kernel_window: None,
            eager_map: false,
            shared_from: None,
            external: None,
            stats: OpStats::default(),
        }
    }

    pub(crate) fn map_count(&self) -> usize {
        self.map_ids.len()
    }
}

/// Copy of the resource fields an operation needs while working outside the
/// registry lock.
#[derive(Clone, Debug)]
pub(crate) struct ResourceSnapshot {
    pub handle: Handle,
    pub session: SessionId,
    pub owner: Pid,
    pub cache: CachePolicy,
    pub size: u32,
    pub remote: RemoteHandle,
    pub base_addr: VcAddress,
    pub lock_count: u32,
    pub map_count: usize,
    pub kernel_window: Option<(usize, usize)>,
    pub eager_map: bool,
    pub imported: bool,
}

impl ResourceSnapshot {
    fn of(res: &Resource) -> Self {
        Self {
            handle: res.handle,
            session: res.session,
            owner: res.owner,
            cache: res.cache,
            size: res.size,
            remote: res.remote,
            base_addr: res.base_addr,
            lock_count: res.lock_count,
            map_count: res.map_count(),
            kernel_window: res.kernel_window,
            eager_map: res.eager_map,
            imported: res.external.is_some(),
        }
    }
}

/// Deferred destruction work returned by [`State::release`].
#[derive(Debug)]
pub(crate) struct DestroyWork {
    /// The unlinked resource. Dropping it releases any imported buffer.
    pub resource: Resource,
    /// Map entries that were removed and whose regions must be torn down.
    pub unmaps: Vec<Mapping>,
    /// Whether the remote handle must be freed. False when another resource
    /// still shares it.
    pub free_remote: bool,
    /// Share parent whose reference must now be dropped.
    pub then_release: Option<Handle>,
}

/// Outcome of a release.
#[derive(Debug)]
pub(crate) enum ReleaseAction {
    /// References remain; nothing to do.
    InUse,
    /// No such resource, or its reference count was already zero.
    NotFound,
    /// Last reference dropped (or release was forced). The caller must
    /// perform the contained work outside the registry lock.
    Destroy(DestroyWork),
}

/// The registry tables. One lock covers all of them.
#[derive(Default)]
pub(crate) struct State {
    pub resources: Vec<Resource>,
    pub mappings: Vec<Mapping>,
    pub sessions: HashMap<u32, Session>,
    /// Counters of resources destroyed by forced teardown.
    pub terminated: GlobalStats,
    /// Counters of resources freed in the normal way.
    pub deceased: GlobalStats,
    next_map_id: u64,
}

impl State {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_map_id(&mut self) -> MapId {
        self.next_map_id += 1;
        MapId(self.next_map_id)
    }

    pub(crate) fn insert_resource(&mut self, resource: Resource) {
        if let Some(sess) = self.sessions.get_mut(&resource.session.0) {
            sess.resources.push(resource.handle);
        }
        self.resources.push(resource);
    }

    /// Find a resource within a session without touching its reference count.
    pub(crate) fn find_mut(&mut self, session: SessionId, handle: Handle) -> Option<&mut Resource> {
        self.resources
            .iter_mut()
            .find(|r| r.session == session && r.handle == handle)
    }

    pub(crate) fn find(&self, session: SessionId, handle: Handle) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.session == session && r.handle == handle)
    }

    /// Find a resource by handle across all sessions.
    pub(crate) fn find_global_mut(&mut self, handle: Handle) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.handle == handle)
    }

    /// Take a reference on a session's resource and snapshot it.
    pub(crate) fn acquire(
        &mut self,
        session: SessionId,
        handle: Handle,
    ) -> Option<ResourceSnapshot> {
        let res = self.find_mut(session, handle)?;
        res.ref_count += 1;
        Some(ResourceSnapshot::of(res))
    }

    /// Take a reference on a resource regardless of owning session. Used
    /// when sharing and when chasing a share parent.
    pub(crate) fn acquire_global(&mut self, handle: Handle) -> Option<ResourceSnapshot> {
        let res = self.find_global_mut(handle)?;
        res.ref_count += 1;
        Some(ResourceSnapshot::of(res))
    }

    /// Take a reference on the first resource still linked to a session.
    /// Drives the teardown loop at session close.
    pub(crate) fn acquire_first(&mut self, session: SessionId) -> Option<ResourceSnapshot> {
        let handle = *self.sessions.get(&session.0)?.resources.first()?;
        self.acquire(session, handle)
    }

    /// Whether any other resource shares `remote`.
    fn remote_shared(&self, remote: RemoteHandle, excluding: Handle) -> bool {
        !remote.is_none()
            && self
                .resources
                .iter()
                .any(|r| r.handle != excluding && r.remote == remote)
    }

    /// Drop a reference. `force` destroys the resource even if references
    /// remain; it is only used by session teardown.
    pub(crate) fn release(&mut self, handle: Handle, force: bool) -> ReleaseAction {
        let Some(idx) = self.resources.iter().position(|r| r.handle == handle) else {
            return ReleaseAction::NotFound;
        };

        {
            let res = &mut self.resources[idx];
            if res.ref_count == 0 {
                // Releasing more than was acquired. Tolerated so teardown
                // can sweep without racing normal frees, but logged upstream.
                return ReleaseAction::NotFound;
            }
            res.ref_count -= 1;
            if res.ref_count != 0 && !force {
                return ReleaseAction::InUse;
            }
        }

        let mut resource = self.resources.remove(idx);
        if let Some(sess) = self.sessions.get_mut(&resource.session.0) {
            sess.resources.retain(|h| *h != resource.handle);
        }

        let free_remote =
            !resource.remote.is_none() && !self.remote_shared(resource.remote, resource.handle);
        let unmaps = self.remove_mappings_of(resource.handle);
        resource.map_ids.clear();
        let then_release = resource.shared_from.take();

        let pile = if force {
            &mut self.terminated
        } else {
            &mut self.deceased
        };
        pile.absorb(&resource.stats);

        ReleaseAction::Destroy(DestroyWork {
            resource,
            unmaps,
            free_remote,
            then_release,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAGE_SHIFT;

    fn state_with_session(id: u32, pid: u32) -> State {
        let mut state = State::new();
        state
            .sessions
            .insert(id, Session::new(SessionId(id), Pid(pid)));
        state
    }

    fn handle(n: u32) -> Handle {
        Handle(n << PAGE_SHIFT)
    }

    fn resource(state: &mut State, n: u32, session: u32) -> Handle {
        let h = handle(n);
        let mut res = Resource::new(
            h,
            SessionId(session),
            Pid(100),
            "test".into(),
            CachePolicy::None,
            4096,
        );
        res.remote = RemoteHandle(n);
        state.insert_resource(res);
        h
    }

    #[test]
    fn test_release_at_last_reference() {
        let mut state = state_with_session(1, 100);
        let h = resource(&mut state, 1, 1);

        assert!(matches!(state.release(h, false), ReleaseAction::Destroy(_)));
        assert!(state.resources.is_empty());
        assert!(state.sessions[&1].resources.is_empty());
    }

    #[test]
    fn test_acquire_defers_destruction() {
        let mut state = state_with_session(1, 100);
        let h = resource(&mut state, 1, 1);

        state.acquire(SessionId(1), h).unwrap();
        assert!(matches!(state.release(h, false), ReleaseAction::InUse));
        assert!(matches!(state.release(h, false), ReleaseAction::Destroy(_)));
    }

    #[test]
    fn test_release_of_zero_ref_is_guarded() {
        let mut state = state_with_session(1, 100);
        let h = resource(&mut state, 1, 1);
        assert!(matches!(state.release(h, false), ReleaseAction::Destroy(_)));
        assert!(matches!(state.release(h, false), ReleaseAction::NotFound));
    }

    #[test]
    fn test_forced_release_ignores_references() {
        let mut state = state_with_session(1, 100);
        let h = resource(&mut state, 1, 1);
        state.acquire(SessionId(1), h).unwrap();
        state.acquire(SessionId(1), h).unwrap();

        assert!(matches!(state.release(h, true), ReleaseAction::Destroy(_)));
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_shared_remote_handle_survives_duplicate() {
        let mut state = state_with_session(1, 100);
        let parent = resource(&mut state, 1, 1);

        // Duplicate with the same remote handle, as share does.
        let dup = handle(2);
        let mut res = Resource::new(
            dup,
            SessionId(1),
            Pid(100),
            "dup".into(),
            CachePolicy::None,
            4096,
        );
        res.remote = RemoteHandle(1);
        res.shared_from = Some(parent);
        state.insert_resource(res);
        // The share holds a reference on its parent.
        state.acquire(SessionId(1), parent).unwrap();

        let then_release = match state.release(dup, false) {
            ReleaseAction::Destroy(work) => {
                assert!(!work.free_remote);
                work.then_release
            }
            other => panic!("expected destroy, got {:?}", other),
        };

        // Dropping the share's parent reference leaves the creation one.
        assert_eq!(then_release, Some(parent));
        assert!(matches!(state.release(parent, false), ReleaseAction::InUse));

        // The parent still owns the remote handle and frees it.
        match state.release(parent, false) {
            ReleaseAction::Destroy(work) => assert!(work.free_remote),
            other => panic!("expected destroy, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_roll_into_the_right_pile() {
        let mut state = state_with_session(1, 100);
        let freed = resource(&mut state, 1, 1);
        let killed = resource(&mut state, 2, 1);

        state
            .find_mut(SessionId(1), freed)
            .unwrap()
            .stats
            .count(crate::stats::OpKind::Lock);
        let _ = state.release(freed, false);
        assert_eq!(state.deceased.occurrences, 1);
        assert_eq!(state.terminated.occurrences, 0);

        let _ = state.release(killed, true);
        assert_eq!(state.terminated.occurrences, 1);
    }

    #[test]
    fn test_acquire_first_walks_session_list() {
        let mut state = state_with_session(1, 100);
        let h1 = resource(&mut state, 1, 1);
        let h2 = resource(&mut state, 2, 1);

        let snap = state.acquire_first(SessionId(1)).unwrap();
        assert_eq!(snap.handle, h1);
        let _ = state.release(h1, false);
        let _ = state.release(h1, true);

        let snap = state.acquire_first(SessionId(1)).unwrap();
        assert_eq!(snap.handle, h2);
    }
}
