//! The operation dispatcher.
//!
//! [`SharedMemoryManager`] owns the registry state and brokers every
//! operation between sessions, the resource registry, the mapping table and
//! the three collaborators: the remote memory service, the address-space
//! mechanism and the cache primitives.
//!
//! # Locking
//!
//! One mutex (the map lock) covers the whole registry: sessions, resources
//! and the mapping table. A second, narrower mutex serializes handle
//! assignment. Address-space and cache collaborators are leaf calls and may
//! be invoked while holding the map lock; remote-service calls block waiting
//! for the coprocessor and are therefore never made under it. Operations
//! that need a remote call take a reference on the resource, copy the fields
//! they need, drop the lock for the call, and re-validate under the lock
//! before mutating.
//!
//! # Interrupted calls
//!
//! A remote call interrupted by a signal is surfaced as
//! [`Error::Interrupted`] and parks the action and transaction id on the
//! session. The next operation dispatched for that session (or its close)
//! first tells the remote side to discard the stale transaction.

use crate::cache::{self, CacheOp, CachePrimitives};
use crate::error::{Error, Result};
use crate::import::ExternalBuffer;
use crate::registry::{DestroyWork, ReleaseAction, Resource, ResourceSnapshot, State};
use crate::remote::{
    AllocRequest, ImportRequest, RemoteAction, RemoteError, SharedMemoryService,
    RESOURCE_NAME_DEFAULT, RESOURCE_NAME_MAX,
};
use crate::session::Session;
use crate::stats::OpKind;
use crate::types::{
    page_align, CachePolicy, Handle, MapId, Pid, RemoteHandle, SessionId, VcAddress,
    PAGE_SHIFT, PAGE_SIZE, VC_ADDR_MASK,
};
use crate::vspace::AddressSpace;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Session id reserved for the in-kernel client.
const KERNEL_SESSION: SessionId = SessionId(0);

/// Manager-wide configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManagerConfig {
    /// Bus address of the start of the coprocessor memory window, added to
    /// window offsets when deriving physical page frames.
    pub phys_addr_base: u64,
}

/// Parameters of an allocation request.
#[derive(Clone, Debug)]
pub struct AllocParams {
    /// Size of one unit in bytes. Page-aligned before the remote call.
    pub size: u32,
    /// Number of units. Zero is treated as one.
    pub num: u32,
    /// Cache policy for the new resource.
    pub cache: CachePolicy,
    /// Debug name. Empty selects a default; overlong names are truncated.
    pub name: String,
    /// Pre-fault the whole range whenever the resource is mapped.
    pub eager_map: bool,
}

impl AllocParams {
    /// Allocation of `size` bytes with default policy and name.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            num: 1,
            cache: CachePolicy::None,
            name: String::new(),
            eager_map: false,
        }
    }
}

/// Flags controlling an unlock.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlockOptions {
    /// Flush host caches over the resource's live mappings before unlocking.
    pub flush: bool,
    /// Wait for the coprocessor to acknowledge the unlock.
    pub wait_reply: bool,
    /// Drop the host-side lock without telling the remote side. Used when
    /// the remote state is known to be gone already.
    pub skip_remote_unlock: bool,
}

/// One entry of a cache-maintenance batch. A `Nop` entry terminates the
/// batch early.
#[derive(Clone, Copy, Debug)]
pub struct CleanInvalidEntry {
    /// Raw operation code, decoded with [`CacheOp::from_raw`].
    pub op: u32,
    /// Resource the range belongs to.
    pub handle: Handle,
    /// Start of the range in the caller's address space.
    pub addr: usize,
    /// Range length in bytes.
    pub size: usize,
}

/// One pinned 2D block operation: `block_count` blocks of `block_size`
/// bytes, starts spaced `stride` bytes apart.
#[derive(Clone, Copy, Debug)]
pub struct BlockCacheOp {
    /// Raw operation code, decoded with [`CacheOp::from_raw`].
    pub op: u32,
    /// Address of the first block in the caller's address space.
    pub addr: usize,
    /// Number of blocks.
    pub block_count: usize,
    /// Bytes per block.
    pub block_size: usize,
    /// Distance between block starts.
    pub stride: usize,
}

/// Result of a check query: the attributes of a live resource.
#[derive(Clone, Copy, Debug)]
pub struct ResourceCheck {
    /// Current coprocessor-window address.
    pub vc_addr: VcAddress,
    /// Resource size in bytes.
    pub size: u32,
    /// Cache policy.
    pub cache: CachePolicy,
}

struct LockOutcome {
    vc_addr: VcAddress,
    kernel_addr: Option<usize>,
}

/// The shared-memory manager.
pub struct SharedMemoryManager {
    state: Mutex<State>,
    /// Guid assignment lock, deliberately separate from the map lock.
    guid: Mutex<u32>,
    next_session: Mutex<u32>,
    remote: Arc<dyn SharedMemoryService>,
    vspace: Arc<dyn AddressSpace>,
    cache: Arc<dyn CachePrimitives>,
    config: ManagerConfig,
}

impl SharedMemoryManager {
    /// Create a manager over the given collaborators. The kernel session
    /// (pid 0) is created immediately.
    pub fn new(
        remote: Arc<dyn SharedMemoryService>,
        vspace: Arc<dyn AddressSpace>,
        cache: Arc<dyn CachePrimitives>,
        config: ManagerConfig,
    ) -> Self {
        let mut state = State::new();
        state
            .sessions
            .insert(KERNEL_SESSION.0, Session::new(KERNEL_SESSION, Pid::KERNEL));
        Self {
            state: Mutex::new(state),
            guid: Mutex::new(0),
            next_session: Mutex::new(0),
            remote,
            vspace,
            cache,
            config,
        }
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn next_guid(&self) -> Handle {
        let mut guid = self.guid.lock().unwrap();
        *guid += 1;
        // The shift discards the counter's top bits, so handles repeat after
        // 2^20 allocations.
        Handle(guid.wrapping_shl(PAGE_SHIFT))
    }

    fn phys_of(&self, vc_addr: VcAddress) -> u64 {
        self.config.phys_addr_base + u64::from(vc_addr & VC_ADDR_MASK)
    }

    /// Validate the session, run any pending interrupted-action cleanup, and
    /// return the session's pid.
    fn begin(&self, session: SessionId) -> Result<Pid> {
        let (pending, pid) = {
            let mut st = self.state();
            let sess = st.sessions.get_mut(&session.0).ok_or(Error::NotFound)?;
            (sess.take_restart(), sess.pid)
        };
        if let Some((action, trans_id)) = pending {
            debug!(?action, trans_id, "cleaning up interrupted exchange");
            self.remote.clean_up(action, trans_id);
        }
        Ok(pid)
    }

    /// Translate a remote error, parking interrupted exchanges on the
    /// session for later cleanup.
    fn remote_failed(&self, session: SessionId, action: RemoteAction, err: RemoteError) -> Error {
        match err {
            RemoteError::Interrupted { trans_id } => {
                debug!(?action, trans_id, "remote call interrupted");
                let mut st = self.state();
                if let Some(sess) = st.sessions.get_mut(&session.0) {
                    sess.note_interrupt(action, trans_id);
                }
                Error::Interrupted
            }
            RemoteError::Failed { status, trans_id } => {
                error!(?action, status, trans_id, "remote call failed");
                Error::Remote { status }
            }
        }
    }

    /// Take a reference on a session's resource after checking ownership.
    /// Kernel-owned resources and kernel callers bypass the check.
    fn acquire_checked(
        st: &mut State,
        session: SessionId,
        handle: Handle,
        caller: Pid,
    ) -> Result<ResourceSnapshot> {
        let snap = st.acquire(session, handle).ok_or(Error::NotFound)?;
        if !snap.owner.is_kernel() && !caller.is_kernel() && snap.owner != caller {
            warn!(%handle, caller = %caller, owner = %snap.owner, "ownership mismatch");
            let _ = st.release(handle, false);
            return Err(Error::PermissionDenied {
                caller: caller.0,
                owner: snap.owner.0,
            });
        }
        Ok(snap)
    }

    /// Drop a reference and execute any resulting destruction, following the
    /// share-parent chain.
    fn finish_release(&self, handle: Handle, force: bool) {
        let mut next = Some((handle, force));
        while let Some((h, f)) = next.take() {
            let action = self.state().release(h, f);
            match action {
                ReleaseAction::InUse => {}
                ReleaseAction::NotFound => {
                    error!(handle = %h, "release of an untracked or zero-reference resource");
                }
                ReleaseAction::Destroy(work) => {
                    next = self.execute_destroy(work).map(|p| (p, false));
                }
            }
        }
    }

    /// Side effects of destruction, run outside the map lock. Returns the
    /// share parent that must be released next, if any.
    fn execute_destroy(&self, work: DestroyWork) -> Option<Handle> {
        for m in &work.unmaps {
            if let Err(e) = self.vspace.unmap(m.pid, m.addr, m.len) {
                debug!(pid = %m.pid, addr = m.addr, "mapping already gone at destroy: {e}");
            }
        }
        if let Some((va, len)) = work.resource.kernel_window {
            self.vspace.unmap_physical(va, len);
        }
        if work.free_remote {
            if let Err(err) = self.remote.free(work.resource.remote, work.resource.base_addr) {
                // A remote free failure leaks on the remote side only; local
                // destruction proceeds regardless.
                error!(
                    handle = %work.resource.handle,
                    remote = %work.resource.remote,
                    "remote free failed: {err:?}"
                );
                if let RemoteError::Interrupted { trans_id } = err {
                    self.remote.clean_up(RemoteAction::Free, trans_id);
                }
            }
        }
        // Dropping the resource detaches any imported buffer.
        work.then_release
    }

    fn clamp_name(name: &str) -> String {
        let name = if name.is_empty() {
            RESOURCE_NAME_DEFAULT
        } else {
            name
        };
        name.chars().take(RESOURCE_NAME_MAX).collect()
    }

    // ---- session lifecycle -------------------------------------------------

    /// Open a session for `pid`.
    pub fn open_session(&self, pid: Pid) -> SessionId {
        let id = {
            let mut next = self.next_session.lock().unwrap();
            *next += 1;
            SessionId(*next)
        };
        self.state().sessions.insert(id.0, Session::new(id, pid));
        debug!(session = id.0, %pid, "session opened");
        id
    }

    /// Close a session, force-destroying every resource it still owns.
    ///
    /// A pending interrupted exchange is cleaned up first so the remote side
    /// does not hold state for a client that is gone. Each remaining
    /// resource is released twice: once for the reference taken while
    /// enumerating, once (forced) to strip the creation reference and any
    /// leaked ones.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        let pending = {
            let mut st = self.state();
            let sess = st.sessions.get_mut(&session.0).ok_or(Error::NotFound)?;
            sess.take_restart()
        };
        if let Some((action, trans_id)) = pending {
            debug!(?action, trans_id, "cleaning up interrupted exchange at close");
            self.remote.clean_up(action, trans_id);
        }

        loop {
            let snap = self.state().acquire_first(session);
            let Some(snap) = snap else { break };
            if snap.lock_count > 0 {
                warn!(handle = %snap.handle, locks = snap.lock_count, "still locked at session close");
            }
            self.finish_release(snap.handle, false);
            self.finish_release(snap.handle, true);
        }

        let mut st = self.state();
        if let Some(sess) = st.sessions.remove(&session.0) {
            st.terminated.stats.merge(&sess.stats);
            debug!(session = sess.id.0, "session closed");
        }
        Ok(())
    }

    // ---- creation ----------------------------------------------------------

    /// Allocate a new resource backed by coprocessor memory.
    pub fn alloc(&self, session: SessionId, params: AllocParams) -> Result<Handle> {
        let pid = self.begin(session)?;
        if params.size == 0 {
            return Err(Error::InvalidArgument("allocation size is zero".into()));
        }
        let base_unit = page_align(params.size);
        let num_unit = params.num.max(1);
        let name = Self::clamp_name(&params.name);

        let req = AllocRequest {
            cached: params.cache.is_vc_cached(),
            base_unit,
            num_unit,
            alignment: PAGE_SIZE as u32,
            allocator: pid,
            name: name.clone(),
        };
        let reply = match self.remote.alloc(&req) {
            Ok(reply) => reply,
            Err(err) => {
                let mut st = self.state();
                if let Some(sess) = st.sessions.get_mut(&session.0) {
                    sess.stats.count(OpKind::Alloc);
                    sess.stats.count_failure(OpKind::Alloc);
                }
                drop(st);
                return Err(match self.remote_failed(session, RemoteAction::Alloc, err) {
                    Error::Remote { .. } => Error::OutOfMemory,
                    e => e,
                });
            }
        };

        let handle = self.next_guid();
        let mut st = self.state();
        if !st.sessions.contains_key(&session.0) {
            // The session vanished while we were talking to the remote side.
            drop(st);
            if let Err(e) = self.remote.free(reply.handle, reply.addr) {
                error!(remote = %reply.handle, "unwind of orphaned allocation failed: {e:?}");
            }
            return Err(Error::NotFound);
        }
        let mut res = Resource::new(
            handle,
            session,
            pid,
            name,
            params.cache,
            base_unit.saturating_mul(num_unit),
        );
        res.remote = reply.handle;
        res.base_addr = reply.addr;
        res.eager_map = params.eager_map;
        res.stats.count(OpKind::Alloc);
        st.insert_resource(res);
        debug!(%handle, remote = %reply.handle, addr = reply.addr, "allocated");
        Ok(handle)
    }

    /// Create a new resource aliasing an existing one's backing memory.
    ///
    /// The target may belong to any session. The new resource holds a
    /// reference on the target, so the backing allocation survives until
    /// both are freed. Returns the new handle and the shared size.
    pub fn alloc_share(&self, session: SessionId, target: Handle) -> Result<(Handle, u32)> {
        let pid = self.begin(session)?;
        let handle = self.next_guid();

        let mut st = self.state();
        if !st.sessions.contains_key(&session.0) {
            return Err(Error::NotFound);
        }
        let Some(parent) = st.acquire_global(target) else {
            debug!(%target, "share target not found");
            return Err(Error::NotFound);
        };
        let name = st
            .find_global_mut(target)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| RESOURCE_NAME_DEFAULT.into());

        let mut res = Resource::new(handle, session, pid, name, parent.cache, parent.size);
        res.remote = parent.remote;
        res.base_addr = parent.base_addr;
        res.shared_from = Some(target);
        res.stats.count(OpKind::Alloc);
        st.insert_resource(res);
        debug!(%handle, %target, "shared");
        Ok((handle, parent.size))
    }

    /// Import a host-owned buffer as a resource.
    ///
    /// On failure the buffer is dropped, detaching the attachment made by
    /// [`ExternalBuffer::attach`].
    pub fn import(
        &self,
        session: SessionId,
        buffer: ExternalBuffer,
        cache: CachePolicy,
        name: &str,
    ) -> Result<Handle> {
        let pid = self.begin(session)?;
        let name = Self::clamp_name(name);
        let size = buffer.size() as u32;

        let req = ImportRequest {
            cached: cache.is_vc_cached(),
            addr: buffer.bus_address(),
            size,
            allocator: pid,
            name: name.clone(),
        };
        let reply = match self.remote.import(&req) {
            Ok(reply) => reply,
            Err(err) => {
                let mut st = self.state();
                if let Some(sess) = st.sessions.get_mut(&session.0) {
                    sess.stats.count(OpKind::Import);
                    sess.stats.count_failure(OpKind::Import);
                }
                drop(st);
                return Err(match self.remote_failed(session, RemoteAction::Import, err) {
                    Error::Remote { .. } => Error::OutOfMemory,
                    e => e,
                });
            }
        };

        let handle = self.next_guid();
        let mut st = self.state();
        if !st.sessions.contains_key(&session.0) {
            drop(st);
            if let Err(e) = self.remote.free(reply.handle, 0) {
                error!(remote = %reply.handle, "unwind of orphaned import failed: {e:?}");
            }
            return Err(Error::NotFound);
        }
        let base_addr = (buffer.bus_address() as u32) & VC_ADDR_MASK;
        let mut res = Resource::new(handle, session, pid, name, cache, size);
        res.remote = reply.handle;
        res.base_addr = base_addr;
        res.external = Some(buffer);
        res.stats.count(OpKind::Import);
        st.insert_resource(res);
        debug!(%handle, remote = %reply.handle, "imported");
        Ok(handle)
    }

    // ---- destruction -------------------------------------------------------

    /// Free a resource. The caller must own it, unless it is kernel-owned.
    ///
    /// Drops the creation reference; destruction happens once every other
    /// holder releases theirs.
    pub fn free(&self, session: SessionId, handle: Handle) -> Result<()> {
        let pid = self.begin(session)?;
        {
            let mut st = self.state();
            Self::acquire_checked(&mut st, session, handle, pid)?;
            if let Some(res) = st.find_mut(session, handle) {
                res.stats.count(OpKind::Free);
            }
        }
        // Once for the reference above, once for the creation reference.
        self.finish_release(handle, false);
        self.finish_release(handle, false);
        Ok(())
    }

    /// Resize an unlocked, unmapped resource. Returns the previous size.
    pub fn resize(&self, session: SessionId, handle: Handle, new_size: u32) -> Result<u32> {
        let pid = self.begin(session)?;
        if new_size == 0 {
            return Err(Error::InvalidArgument("resize to zero".into()));
        }
        let snap = {
            let mut st = self.state();
            let snap = Self::acquire_checked(&mut st, session, handle, pid)?;
            if snap.lock_count != 0 {
                let _ = st.release(handle, false);
                return Err(Error::Busy("resource is locked".into()));
            }
            if snap.map_count != 0 {
                let _ = st.release(handle, false);
                return Err(Error::Busy("resource is mapped".into()));
            }
            snap
        };

        let aligned = page_align(new_size);
        if let Err(err) = self.remote.resize(snap.remote, snap.base_addr, aligned) {
            self.finish_release(handle, false);
            return Err(self.remote_failed(session, RemoteAction::Resize, err));
        }

        let old_size = snap.size;
        {
            let mut st = self.state();
            if let Some(res) = st.find_global_mut(handle) {
                res.size = aligned;
            }
        }
        self.finish_release(handle, false);
        Ok(old_size)
    }

    // ---- lock / unlock -----------------------------------------------------

    /// Lock a resource for host access. Returns the coprocessor-window
    /// address the memory is pinned at.
    ///
    /// Only the first lock talks to the remote side; further locks just
    /// increment the count. A kernel-owned resource with no live mapping is
    /// given a kernel window so the memory is reachable at all.
    pub fn lock(&self, session: SessionId, handle: Handle) -> Result<VcAddress> {
        let pid = self.begin(session)?;
        self.lock_impl(pid, session, handle, None, None)
            .map(|o| o.vc_addr)
    }

    /// Lock and simultaneously change the cache policy applied to future
    /// mappings.
    pub fn lock_with_cache(
        &self,
        session: SessionId,
        handle: Handle,
        cache: CachePolicy,
    ) -> Result<VcAddress> {
        let pid = self.begin(session)?;
        self.lock_impl(pid, session, handle, Some(cache), None)
            .map(|o| o.vc_addr)
    }

    /// `known_addr` adopts a lock the coprocessor already holds at that
    /// address instead of issuing a remote lock.
    fn lock_impl(
        &self,
        caller: Pid,
        session: SessionId,
        handle: Handle,
        cache_change: Option<CachePolicy>,
        known_addr: Option<VcAddress>,
    ) -> Result<LockOutcome> {
        let snap = {
            let mut st = self.state();
            let snap = Self::acquire_checked(&mut st, session, handle, caller)?;
            if let Some(policy) = cache_change {
                if let Some(res) = st.find_mut(session, handle) {
                    res.cache = policy;
                }
            }
            snap
        };

        let mut vc_addr = snap.base_addr;
        let first_lock = if let Some(addr) = known_addr {
            // The caller already knows where the memory is pinned (the
            // coprocessor told it), so the lock is adopted without a remote
            // exchange.
            let mut st = self.state();
            if let Some(res) = st.find_global_mut(handle) {
                res.stats.count(OpKind::Lock);
                res.lock_count += 1;
                res.base_addr = addr;
            }
            vc_addr = addr;
            false
        } else {
            // Decide the first-lock transition from live state, atomically
            // with the increment; the snapshot count may be stale by now.
            let mut st = self.state();
            match st.find_global_mut(handle) {
                Some(res) if res.lock_count > 0 => {
                    res.stats.count(OpKind::Lock);
                    res.lock_count += 1;
                    vc_addr = res.base_addr;
                    false
                }
                _ => true,
            }
        };

        if first_lock {
            match self.remote.lock(snap.remote, snap.base_addr) {
                Ok(reply) => {
                    // Another caller may have won the first-lock race while
                    // the remote call was in flight. The loser keeps its
                    // logical lock and returns the duplicate remote one.
                    let lost_race = {
                        let mut st = self.state();
                        match st.find_global_mut(handle) {
                            Some(res) => {
                                res.stats.count(OpKind::Lock);
                                if res.lock_count > 0 {
                                    res.lock_count += 1;
                                    vc_addr = res.base_addr;
                                    true
                                } else {
                                    res.lock_count = 1;
                                    res.base_addr = reply.addr;
                                    vc_addr = reply.addr;
                                    if reply.addr != reply.old_addr {
                                        debug!(
                                            %handle,
                                            old = reply.old_addr,
                                            new = reply.addr,
                                            "remote relocated the resource"
                                        );
                                    }
                                    false
                                }
                            }
                            None => true,
                        }
                    };
                    if lost_race {
                        if let Err(e) = self.remote.unlock(snap.remote, reply.addr, false) {
                            warn!(%handle, "returning the duplicate remote lock failed: {e:?}");
                        }
                    }
                }
                Err(err) => {
                    {
                        let mut st = self.state();
                        if let Some(res) = st.find_global_mut(handle) {
                            res.stats.count(OpKind::Lock);
                            res.stats.count_failure(OpKind::Lock);
                        }
                    }
                    self.finish_release(handle, false);
                    return Err(self.remote_failed(session, RemoteAction::Lock, err));
                }
            }
        }

        let mut window_failed = false;
        let kernel_addr = {
            let mut st = self.state();
            match st.find_global_mut(handle) {
                Some(res) => {
                    if res.owner.is_kernel() && res.kernel_window.is_none() && res.map_count() == 0
                    {
                        let len = page_align(res.size) as usize;
                        match self.vspace.map_physical(self.phys_of(res.base_addr), len) {
                            Ok(va) => res.kernel_window = Some((va, len)),
                            Err(e) => {
                                error!(%handle, "kernel window map failed: {e}");
                                window_failed = true;
                            }
                        }
                    }
                    res.kernel_window.map(|w| w.0)
                }
                None => None,
            }
        };
        if window_failed {
            self.finish_release(handle, false);
            return Err(Error::OutOfMemory);
        }

        self.finish_release(handle, false);
        Ok(LockOutcome { vc_addr, kernel_addr })
    }

    /// Unlock a resource after host access.
    ///
    /// With `flush` set on a host-cached resource, dirty lines over every
    /// live mapping are written back first (resident pages through the L1,
    /// the whole physical range through the outer cache). The last-unlock
    /// transition is claimed under the map lock; dropping the last lock zaps
    /// the resource's page-table entries so the next touch refaults,
    /// performs the remote unlock, and releases any kernel window.
    pub fn unlock(&self, session: SessionId, handle: Handle, opts: UnlockOptions) -> Result<()> {
        enum Claim {
            Gone,
            Unlocked,
            NotLast,
            Last,
        }

        let pid = self.begin(session)?;
        let (snap, mappings) = {
            let mut st = self.state();
            let snap = Self::acquire_checked(&mut st, session, handle, pid)?;
            let mappings = st.mappings_of(handle);
            (snap, mappings)
        };

        if snap.lock_count == 0 {
            self.finish_release(handle, false);
            return Err(Error::Busy("resource is not locked".into()));
        }

        if opts.flush && snap.cache.is_host_cached() {
            for m in &mappings {
                self.vspace
                    .for_each_resident_page(m.pid, m.addr, m.len, &mut |page, _| {
                        self.cache.flush_range(m.pid, page, PAGE_SIZE);
                    });
            }
            self.cache
                .outer_clean(self.phys_of(snap.base_addr), page_align(snap.size) as usize);
        }

        // Claim the transition under the map lock; the snapshot count may be
        // stale by now.
        let claim = {
            let mut st = self.state();
            match st.find_global_mut(handle) {
                None => Claim::Gone,
                Some(res) if res.lock_count == 0 => Claim::Unlocked,
                Some(res) if res.lock_count > 1 => {
                    res.lock_count -= 1;
                    res.stats.count(OpKind::Unlock);
                    Claim::NotLast
                }
                Some(res) => {
                    res.lock_count = 0;
                    Claim::Last
                }
            }
        };
        match claim {
            Claim::Gone => {
                self.finish_release(handle, false);
                return Err(Error::NotFound);
            }
            Claim::Unlocked => {
                self.finish_release(handle, false);
                return Err(Error::Busy("resource is not locked".into()));
            }
            Claim::NotLast => {
                self.finish_release(handle, false);
                return Ok(());
            }
            Claim::Last => {}
        }

        for m in &mappings {
            self.vspace.zap_range(m.pid, m.addr, m.len);
        }
        if !opts.skip_remote_unlock {
            if let Err(err) = self.remote.unlock(snap.remote, snap.base_addr, opts.wait_reply) {
                {
                    let mut st = self.state();
                    if let Some(res) = st.find_global_mut(handle) {
                        // Undo the claim; a concurrent lock may have arrived
                        // since, so add rather than overwrite.
                        res.lock_count += 1;
                        if let RemoteError::Failed { .. } = err {
                            res.stats.count(OpKind::Unlock);
                            res.stats.count_failure(OpKind::Unlock);
                        }
                        // An interrupted unlock will be retried; counting
                        // the attempt now would double count it.
                    }
                }
                self.finish_release(handle, false);
                return Err(self.remote_failed(session, RemoteAction::Unlock, err));
            }
        }

        let window = {
            let mut st = self.state();
            match st.find_global_mut(handle) {
                Some(res) => {
                    res.stats.count(OpKind::Unlock);
                    // Leave the window alone if a concurrent lock recreated
                    // it in the meantime.
                    if res.lock_count == 0 {
                        res.kernel_window.take()
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some((va, len)) = window {
            self.vspace.unmap_physical(va, len);
        }
        self.finish_release(handle, false);
        Ok(())
    }

    // ---- mapping and faulting ----------------------------------------------

    /// Map a resource into the calling process's address space at `addr`.
    ///
    /// `len` must match the resource's page-aligned size exactly. The range
    /// is lazy by default; resources allocated with the eager flag are
    /// pre-faulted in full before this returns.
    pub fn map(&self, session: SessionId, handle: Handle, addr: usize, len: usize) -> Result<MapId> {
        let pid = self.begin(session)?;
        let snap = {
            let mut st = self.state();
            Self::acquire_checked(&mut st, session, handle, pid)?
        };

        if len != page_align(snap.size) as usize {
            self.finish_release(handle, false);
            return Err(Error::InvalidArgument(format!(
                "mapping length {} does not match resource size {}",
                len,
                page_align(snap.size)
            )));
        }
        if let Err(e) = self.vspace.map_region(pid, addr, len) {
            self.finish_release(handle, false);
            return Err(e);
        }

        let id = {
            let mut st = self.state();
            match st.insert_mapping(handle, session, pid, addr, len) {
                Some(id) => {
                    if let Some(res) = st.find_global_mut(handle) {
                        res.stats.count(OpKind::Map);
                    }
                    id
                }
                None => {
                    drop(st);
                    let _ = self.vspace.unmap(pid, addr, len);
                    self.finish_release(handle, false);
                    return Err(Error::NotFound);
                }
            }
        };
        self.finish_release(handle, false);

        if snap.eager_map {
            for off in (0..len).step_by(PAGE_SIZE) {
                if let Err(e) = self.fault(pid, addr + off) {
                    error!(%handle, addr = addr + off, "eager pre-fault failed: {e}");
                    self.mapping_closed(id);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Note that an address-space duplication created another reference to
    /// a mapping.
    pub fn mapping_opened(&self, id: MapId) {
        self.state().mapping_opened(id);
    }

    /// Note that a mapping reference went away. The last reference removes
    /// the entry, tears the region down, and drops the fault-taken lock if
    /// this was the resource's final mapping.
    pub fn mapping_closed(&self, id: MapId) {
        let removed = self.state().mapping_closed(id);
        let Some(m) = removed else { return };

        if let Err(e) = self.vspace.unmap(m.pid, m.addr, m.len) {
            debug!(pid = %m.pid, addr = m.addr, "region already gone at close: {e}");
        }

        let drop_lock = {
            let mut st = self.state();
            st.find_global_mut(m.resource)
                .map(|r| r.lock_count > 0 && r.map_ids.is_empty())
                .unwrap_or(false)
        };
        if drop_lock {
            if let Err(e) = self.unlock(m.session, m.resource, UnlockOptions::default()) {
                debug!(handle = %m.resource, "unlock at last unmap failed: {e}");
            }
        }
    }

    /// Service a page fault at `addr` in `pid`'s address space.
    ///
    /// Locks the resource on first touch, invalidates the outer cache over
    /// the freshly pinned range, and installs the single faulting page.
    /// Returns the installed page frame number. Any failure to lock is a
    /// hard bus error; faults cannot be restarted.
    pub fn fault(&self, pid: Pid, addr: usize) -> Result<u64> {
        let (mapping, snap) = {
            let mut st = self.state();
            let m = st.mapping_by_addr(pid, addr).cloned().ok_or(Error::NotFound)?;
            let snap = st.acquire_global(m.resource).ok_or(Error::NotFound)?;
            (m, snap)
        };
        let handle = snap.handle;

        let need_lock = {
            let st = self.state();
            st.resources
                .iter()
                .find(|r| r.handle == handle)
                .map(|r| r.lock_count == 0)
                .unwrap_or(false)
        };

        if need_lock {
            match self.remote.lock(snap.remote, snap.base_addr) {
                Ok(reply) => {
                    // A concurrent lock may have pinned the memory while the
                    // remote call was in flight; the fault takes no logical
                    // lock of its own in that case and returns the duplicate.
                    let lost_race = {
                        let mut st = self.state();
                        match st.find_global_mut(handle) {
                            Some(res) => {
                                res.stats.count(OpKind::Lock);
                                if res.lock_count > 0 {
                                    true
                                } else {
                                    res.lock_count = 1;
                                    res.base_addr = reply.addr;
                                    if reply.addr != reply.old_addr {
                                        debug!(%handle, new = reply.addr, "resource moved before fault");
                                    }
                                    false
                                }
                            }
                            None => true,
                        }
                    };
                    if lost_race {
                        if let Err(e) = self.remote.unlock(snap.remote, reply.addr, false) {
                            warn!(%handle, "returning the duplicate remote lock failed: {e:?}");
                        }
                    } else {
                        self.cache
                            .outer_inv(self.phys_of(reply.addr), page_align(snap.size) as usize);
                    }
                }
                Err(err) => {
                    {
                        let mut st = self.state();
                        if let Some(res) = st.find_global_mut(handle) {
                            res.stats.count(OpKind::Lock);
                            res.stats.count_failure(OpKind::Lock);
                        }
                    }
                    self.finish_release(handle, false);
                    error!(%handle, addr, "lock-on-fault failed: {err:?}");
                    return Err(Error::BusError);
                }
            }
        }

        let base = {
            let st = self.state();
            st.resources
                .iter()
                .find(|r| r.handle == handle)
                .map(|r| r.base_addr)
                .unwrap_or(snap.base_addr)
        };
        let page = addr & !(PAGE_SIZE - 1);
        let offset = (page - mapping.addr) as u64;
        let pfn = (self.phys_of(base) + offset) >> PAGE_SHIFT;
        if let Err(e) = self.vspace.insert_page(pid, page, pfn) {
            self.finish_release(handle, false);
            error!(%handle, addr, "page insert failed: {e}");
            return Err(Error::BusError);
        }
        self.finish_release(handle, false);
        Ok(pfn)
    }

    // ---- cache maintenance -------------------------------------------------

    /// Write back and invalidate host caches over a mapped range of a
    /// resource.
    pub fn flush(&self, session: SessionId, handle: Handle, addr: usize, size: usize) -> Result<()> {
        self.cache_op(session, handle, addr, size, CacheOp::Flush, OpKind::Flush)
    }

    /// Invalidate host caches over a mapped range of a resource.
    pub fn invalidate(
        &self,
        session: SessionId,
        handle: Handle,
        addr: usize,
        size: usize,
    ) -> Result<()> {
        self.cache_op(
            session,
            handle,
            addr,
            size,
            CacheOp::Invalidate,
            OpKind::Invalidate,
        )
    }

    /// Apply a batch of up to eight cache-maintenance entries.
    ///
    /// A `Nop` entry terminates the batch; processing stops at the first
    /// failing entry and its error is returned.
    pub fn clean_invalid(&self, session: SessionId, entries: &[CleanInvalidEntry]) -> Result<()> {
        for entry in entries.iter().take(8) {
            let op = CacheOp::from_raw(entry.op)?;
            if op == CacheOp::Nop {
                break;
            }
            let kind = match op {
                CacheOp::Invalidate => OpKind::Invalidate,
                _ => OpKind::Flush,
            };
            self.cache_op(session, entry.handle, entry.addr, entry.size, op, kind)?;
        }
        Ok(())
    }

    /// Apply cache maintenance over pinned 2D block layouts. Each operation
    /// is applied directly by address range, without a residency walk; the
    /// caller guarantees the blocks are resident. Stops at the first
    /// failing operation.
    pub fn clean_invalid_2d(&self, session: SessionId, ops: &[BlockCacheOp]) -> Result<()> {
        let pid = self.begin(session)?;
        for o in ops {
            let op = CacheOp::from_raw(o.op)?;
            cache::apply_2d(
                self.cache.as_ref(),
                op,
                pid,
                o.addr,
                o.block_count,
                o.block_size,
                o.stride,
            )?;
        }
        Ok(())
    }

    fn cache_op(
        &self,
        session: SessionId,
        handle: Handle,
        addr: usize,
        size: usize,
        op: CacheOp,
        kind: OpKind,
    ) -> Result<()> {
        let pid = self.begin(session)?;
        let snap = {
            let mut st = self.state();
            Self::acquire_checked(&mut st, session, handle, pid)?
        };
        let result = self.walk_mapped_range(pid, &snap, addr, size, op);
        {
            let mut st = self.state();
            if let Some(res) = st.find_global_mut(handle) {
                res.stats.count(kind);
                if result.is_err() {
                    res.stats.count_failure(kind);
                }
            }
        }
        self.finish_release(handle, false);
        result
    }

    /// Apply `op` over the resident pages of `[addr, addr+size)`, which must
    /// fall inside one of the caller's mappings of the resource.
    fn walk_mapped_range(
        &self,
        pid: Pid,
        snap: &ResourceSnapshot,
        addr: usize,
        size: usize,
        op: CacheOp,
    ) -> Result<()> {
        if !snap.cache.is_host_cached() {
            return Err(Error::InvalidArgument(
                "resource is not host cached".into(),
            ));
        }
        if size == 0 {
            return Ok(());
        }
        let mapping = {
            let st = self.state();
            match st.mapping_by_addr(pid, addr) {
                Some(m) if m.resource == snap.handle => m.clone(),
                _ => return Err(Error::OutOfRange),
            }
        };
        if addr + size > mapping.addr + mapping.len {
            return Err(Error::OutOfRange);
        }

        let start = addr & !(PAGE_SIZE - 1);
        let end = page_align((addr + size - start) as u32) as usize + start;
        let mut result = Ok(());
        self.vspace
            .for_each_resident_page(pid, start, end - start, &mut |page, _| {
                if result.is_ok() {
                    result = cache::apply_range(self.cache.as_ref(), op, pid, page, PAGE_SIZE);
                }
            });
        result
    }

    // ---- queries -----------------------------------------------------------

    /// Size of a resource, or 0 if the handle is unknown to this session.
    pub fn size_of(&self, session: SessionId, handle: Handle) -> u32 {
        let st = self.state();
        st.find(session, handle).map(|r| r.size).unwrap_or(0)
    }

    /// Attributes of a resource, or `None` if the handle is unknown.
    pub fn check(&self, session: SessionId, handle: Handle) -> Option<ResourceCheck> {
        let st = self.state();
        st.find(session, handle).map(|r| ResourceCheck {
            vc_addr: r.base_addr,
            size: r.size,
            cache: r.cache,
        })
    }

    /// Handle of the resource mapped at `addr` in `pid`'s address space, or
    /// the null handle.
    pub fn handle_from_address(&self, pid: Pid, addr: usize) -> Handle {
        let st = self.state();
        st.mapping_by_addr(pid, addr)
            .map(|m| m.resource)
            .unwrap_or(Handle::NONE)
    }

    /// Remote handle of the resource mapped at `addr`, or the null handle.
    pub fn remote_handle_from_address(&self, pid: Pid, addr: usize) -> RemoteHandle {
        let st = self.state();
        let Some(m) = st.mapping_by_addr(pid, addr) else {
            return RemoteHandle::NONE;
        };
        st.resources
            .iter()
            .find(|r| r.handle == m.resource)
            .map(|r| r.remote)
            .unwrap_or(RemoteHandle::NONE)
    }

    /// Remote handle backing `handle`, or the null handle.
    pub fn remote_handle_of(&self, session: SessionId, handle: Handle) -> RemoteHandle {
        let st = self.state();
        st.find(session, handle)
            .map(|r| r.remote)
            .unwrap_or(RemoteHandle::NONE)
    }

    /// Coprocessor-window address of `handle`, or 0.
    pub fn vc_address_of(&self, session: SessionId, handle: Handle) -> VcAddress {
        let st = self.state();
        st.find(session, handle).map(|r| r.base_addr).unwrap_or(0)
    }

    /// Address `handle` is mapped at in the session's process, or 0.
    pub fn host_address_of(&self, session: SessionId, handle: Handle) -> usize {
        let st = self.state();
        let Some(sess) = st.sessions.get(&session.0) else {
            return 0;
        };
        st.host_addr_for(sess.pid, handle).unwrap_or(0)
    }

    /// Ask the remote side to log its allocation table.
    pub fn walk_remote_allocations(&self) -> Result<()> {
        self.remote.walk_alloc().map_err(|err| match err {
            RemoteError::Interrupted { .. } => Error::Interrupted,
            RemoteError::Failed { status, .. } => Error::Remote { status },
        })
    }

    // ---- kernel-internal entry points --------------------------------------

    /// Allocate through the kernel session.
    pub fn kernel_alloc(&self, size: u32, num: u32, cache: CachePolicy, name: &str) -> Result<Handle> {
        self.alloc(
            KERNEL_SESSION,
            AllocParams {
                size,
                num,
                cache,
                name: name.to_owned(),
                eager_map: false,
            },
        )
    }

    /// Free a kernel-session resource.
    pub fn kernel_free(&self, handle: Handle) -> Result<()> {
        self.free(KERNEL_SESSION, handle)
    }

    /// Lock a kernel-session resource; returns the kernel virtual address of
    /// its window.
    pub fn kernel_lock(&self, handle: Handle) -> Result<usize> {
        self.begin(KERNEL_SESSION)?;
        let outcome = self.lock_impl(Pid::KERNEL, KERNEL_SESSION, handle, None, None)?;
        outcome.kernel_addr.ok_or(Error::OutOfMemory)
    }

    /// Unlock a kernel-session resource.
    pub fn kernel_unlock(&self, handle: Handle, flush: bool, skip_remote_unlock: bool) -> Result<()> {
        self.unlock(
            KERNEL_SESSION,
            handle,
            UnlockOptions {
                flush,
                wait_reply: true,
                skip_remote_unlock,
            },
        )
    }

    /// Adopt a lock on the resource currently residing at `vc_addr`,
    /// wherever it was created. Used by in-kernel clients that learn about
    /// memory from the coprocessor by address; the coprocessor already holds
    /// it pinned there, so no remote lock is issued. Returns the resource's
    /// handle.
    pub fn kernel_map(&self, vc_addr: VcAddress) -> Result<Handle> {
        self.begin(KERNEL_SESSION)?;
        let (session, handle) = {
            let st = self.state();
            st.resources
                .iter()
                .find(|r| r.base_addr == vc_addr)
                .map(|r| (r.session, r.handle))
                .ok_or(Error::NotFound)?
        };
        self.lock_impl(Pid::KERNEL, session, handle, None, Some(vc_addr))?;
        Ok(handle)
    }

    /// Import a host-owned buffer through the kernel session.
    pub fn kernel_import(&self, buffer: ExternalBuffer, cache: CachePolicy, name: &str) -> Result<Handle> {
        self.import(KERNEL_SESSION, buffer, cache, name)
    }

    /// Remote handle of a resource in any session, or the null handle. Lets
    /// in-kernel clients hand the coprocessor a reference to user memory.
    pub fn kernel_remote_handle(&self, handle: Handle) -> RemoteHandle {
        let st = self.state();
        st.resources
            .iter()
            .find(|r| r.handle == handle)
            .map(|r| r.remote)
            .unwrap_or(RemoteHandle::NONE)
    }
}
