//! The host mapping table.
//!
//! Each entry ties a range of a process's address space to a resource. The
//! table answers the reverse questions the fault and cache paths need: which
//! resource does this host address belong to, and where is this resource
//! visible in that process. Entries are reference counted because a region
//! can be duplicated within a process (fork, split) and must outlive every
//! duplicate.
//!
//! The table lives inside [`State`] and shares the registry lock, so a
//! resource and its map entries are always observed consistently.

use crate::registry::State;
use crate::types::{Handle, MapId, Pid, SessionId};

/// One mapped range of a process's address space.
#[derive(Clone, Debug)]
pub(crate) struct Mapping {
    pub id: MapId,
    /// Resource the range exposes.
    pub resource: Handle,
    /// Session that created the mapping.
    pub session: SessionId,
    /// Process the range belongs to.
    pub pid: Pid,
    /// Start of the range.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
    /// Live region references over this entry.
    pub refs: u32,
}

impl Mapping {
    pub(crate) fn contains(&self, pid: Pid, addr: usize) -> bool {
        self.pid == pid && addr >= self.addr && addr < self.addr + self.len
    }
}

impl State {
    /// Register a new mapping of `handle` and link it from the resource.
    /// The resource must exist; the caller has already validated the handle.
    pub(crate) fn insert_mapping(
        &mut self,
        handle: Handle,
        session: SessionId,
        pid: Pid,
        addr: usize,
        len: usize,
    ) -> Option<MapId> {
        let id = self.next_map_id();
        let res = self.find_global_mut(handle)?;
        res.map_ids.push(id);
        self.mappings.push(Mapping {
            id,
            resource: handle,
            session,
            pid,
            addr,
            len,
            refs: 1,
        });
        Some(id)
    }

    /// Bump the region reference of an entry. A no-op for unknown ids, which
    /// happens when a region outlives its resource.
    pub(crate) fn mapping_opened(&mut self, id: MapId) {
        if let Some(m) = self.mappings.iter_mut().find(|m| m.id == id) {
            m.refs += 1;
        }
    }

    /// Drop a region reference. Removes the entry, and its link from the
    /// resource, when the last reference goes.
    pub(crate) fn mapping_closed(&mut self, id: MapId) -> Option<Mapping> {
        let idx = self.mappings.iter().position(|m| m.id == id)?;
        let m = &mut self.mappings[idx];
        m.refs -= 1;
        if m.refs > 0 {
            return None;
        }
        let mapping = self.mappings.remove(idx);
        if let Some(res) = self.find_global_mut(mapping.resource) {
            res.map_ids.retain(|i| *i != mapping.id);
        }
        Some(mapping)
    }

    /// Pull every map entry of `handle` out of the table. Used when the
    /// resource is destroyed.
    pub(crate) fn remove_mappings_of(&mut self, handle: Handle) -> Vec<Mapping> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.mappings.len() {
            if self.mappings[i].resource == handle {
                removed.push(self.mappings.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Entry covering `addr` in `pid`'s address space, if any.
    pub(crate) fn mapping_by_addr(&self, pid: Pid, addr: usize) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.contains(pid, addr))
    }

    /// All entries exposing `handle`, in creation order.
    pub(crate) fn mappings_of(&self, handle: Handle) -> Vec<Mapping> {
        self.mappings
            .iter()
            .filter(|m| m.resource == handle)
            .cloned()
            .collect()
    }

    /// Address `handle` is mapped at in `pid`'s address space, if it is.
    pub(crate) fn host_addr_for(&self, pid: Pid, handle: Handle) -> Option<usize> {
        self.mappings
            .iter()
            .find(|m| m.pid == pid && m.resource == handle)
            .map(|m| m.addr)
    }
}
