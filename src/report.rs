//! Read-only reporting over the registry.
//!
//! Mirrors the debug surfaces of the driver: a snapshot of live resources,
//! a snapshot of live mappings, cumulative statistics split into naturally
//! freed versus force-terminated resources, and a host walk that logs the
//! mapping table. Snapshots are taken under the map lock, so they are
//! internally consistent even while operations run.

use crate::manager::SharedMemoryManager;
use crate::stats::{GlobalStats, OpKind, OpStats};
use crate::types::{CachePolicy, Handle, Pid, RemoteHandle, SessionId, VcAddress};
use tracing::info;

/// Attributes of one live resource.
#[derive(Clone, Debug)]
pub struct ResourceReport {
    /// Process-visible handle.
    pub handle: Handle,
    /// Owning session.
    pub session: SessionId,
    /// Creating process.
    pub owner: Pid,
    /// Debug name.
    pub name: String,
    /// Cache policy.
    pub cache: CachePolicy,
    /// Size in bytes.
    pub size: u32,
    /// Remote identifier.
    pub remote: RemoteHandle,
    /// Last known coprocessor-window address.
    pub vc_addr: VcAddress,
    /// Outstanding references.
    pub ref_count: u32,
    /// Outstanding locks.
    pub lock_count: u32,
    /// Live host mappings.
    pub map_count: usize,
}

/// Attributes of one live mapping.
#[derive(Clone, Debug)]
pub struct MappingReport {
    /// Resource the range exposes.
    pub resource: Handle,
    /// Process the range belongs to.
    pub pid: Pid,
    /// Range start.
    pub addr: usize,
    /// Range length in bytes.
    pub len: usize,
    /// Live region references.
    pub refs: u32,
}

/// Cumulative statistics of destroyed resources.
#[derive(Clone, Debug)]
pub struct StatisticsReport {
    /// Resources freed explicitly.
    pub deceased: GlobalStats,
    /// Resources destroyed by forced session teardown.
    pub terminated: GlobalStats,
}

impl StatisticsReport {
    /// Render the per-operation breakdown of one accumulator, one line per
    /// operation kind.
    pub fn render(stats: &OpStats) -> String {
        let mut out = String::new();
        for kind in OpKind::ALL {
            out.push_str(&format!(
                "{}: tried {} - failed {}\n",
                kind.label(),
                stats.attempts(kind),
                stats.failures(kind)
            ));
        }
        out
    }
}

impl SharedMemoryManager {
    /// Snapshot of every live resource.
    pub fn resources(&self) -> Vec<ResourceReport> {
        let st = self.state();
        st.resources
            .iter()
            .map(|r| ResourceReport {
                handle: r.handle,
                session: r.session,
                owner: r.owner,
                name: r.name.clone(),
                cache: r.cache,
                size: r.size,
                remote: r.remote,
                vc_addr: r.base_addr,
                ref_count: r.ref_count,
                lock_count: r.lock_count,
                map_count: r.map_count(),
            })
            .collect()
    }

    /// Snapshot of every live mapping, optionally restricted to one process.
    pub fn mappings(&self, pid: Option<Pid>) -> Vec<MappingReport> {
        let st = self.state();
        st.mappings
            .iter()
            .filter(|m| pid.map(|p| m.pid == p).unwrap_or(true))
            .map(|m| MappingReport {
                resource: m.resource,
                pid: m.pid,
                addr: m.addr,
                len: m.len,
                refs: m.refs,
            })
            .collect()
    }

    /// Cumulative statistics of destroyed resources.
    pub fn statistics(&self) -> StatisticsReport {
        let st = self.state();
        StatisticsReport {
            deceased: st.deceased.clone(),
            terminated: st.terminated.clone(),
        }
    }

    /// Log the mapping table, optionally restricted to one process.
    pub fn walk_mappings(&self, pid: Option<Pid>) {
        for m in self.mappings(pid) {
            info!(
                resource = %m.resource,
                pid = %m.pid,
                addr = format_args!("{:#x}", m.addr),
                len = m.len,
                refs = m.refs,
                "mapping"
            );
        }
    }
}
