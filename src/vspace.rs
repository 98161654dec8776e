//! Per-process address-space operations.
//!
//! The manager keeps its own mapping table but needs a mechanism to act on
//! the address spaces those mappings live in: tearing regions down, dropping
//! resident pages so the next touch refaults, installing a page on fault,
//! and walking whatever is currently resident for cache maintenance. The
//! kernel side additionally needs physical windows mapped into its own
//! space. [`AddressSpace`] is that seam; [`SimAddressSpace`] is a
//! table-backed simulation of it for hosting the manager in a plain process.

use crate::error::{Error, Result};
use crate::types::{Pid, PAGE_SIZE};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Mechanism for manipulating process address spaces.
///
/// All ranges are byte addresses and lengths; implementations may assume
/// page alignment since the manager only ever maps whole pages.
pub trait AddressSpace: Send + Sync {
    /// Record a fresh region in `pid`'s address space. No pages are resident
    /// until [`AddressSpace::insert_page`] installs them.
    fn map_region(&self, pid: Pid, start: usize, len: usize) -> Result<()>;

    /// Tear down the region starting at `start`, dropping any resident pages.
    fn unmap(&self, pid: Pid, start: usize, len: usize) -> Result<()>;

    /// Drop resident pages in the range without removing the region. The
    /// next access faults again.
    fn zap_range(&self, pid: Pid, start: usize, len: usize);

    /// Install the page with frame number `pfn` at `addr`, resolving a fault.
    fn insert_page(&self, pid: Pid, addr: usize, pfn: u64) -> Result<()>;

    /// Call `f(addr, pfn)` for every page currently resident in the range.
    fn for_each_resident_page(
        &self,
        pid: Pid,
        start: usize,
        len: usize,
        f: &mut dyn FnMut(usize, u64),
    );

    /// Map a physical window into the kernel's own address space, returning
    /// the virtual address.
    fn map_physical(&self, phys: u64, len: usize) -> Result<usize>;

    /// Release a window obtained from [`AddressSpace::map_physical`].
    fn unmap_physical(&self, addr: usize, len: usize);
}

#[derive(Debug)]
struct SimRegion {
    len: usize,
    /// Resident pages, keyed by page-aligned virtual address.
    resident: BTreeMap<usize, u64>,
}

#[derive(Debug, Default)]
struct SimInner {
    regions: HashMap<(u32, usize), SimRegion>,
    kernel_windows: HashMap<usize, usize>,
    next_kernel_va: usize,
}

/// Simulated [`AddressSpace`] backed by in-memory tables.
///
/// Clones share state, so tests can hold one clone for inspection while the
/// manager drives the other.
#[derive(Clone)]
pub struct SimAddressSpace {
    inner: Arc<Mutex<SimInner>>,
}

const SIM_KERNEL_VA_BASE: usize = 0xF000_0000;

impl SimAddressSpace {
    /// Create an empty simulated address space.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                next_kernel_va: SIM_KERNEL_VA_BASE,
                ..SimInner::default()
            })),
        }
    }

    /// Whether a region starting at `start` exists for `pid`.
    pub fn is_mapped(&self, pid: Pid, start: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.regions.contains_key(&(pid.0, start))
    }

    /// Number of resident pages in `pid`'s region at `start`, or `None` if
    /// there is no such region.
    pub fn resident_pages(&self, pid: Pid, start: usize) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .regions
            .get(&(pid.0, start))
            .map(|r| r.resident.len())
    }

    /// Number of live kernel physical windows.
    pub fn kernel_windows(&self) -> usize {
        self.inner.lock().unwrap().kernel_windows.len()
    }
}

impl Default for SimAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SimAddressSpace {
    fn map_region(&self, pid: Pid, start: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.regions.contains_key(&(pid.0, start)) {
            return Err(Error::InvalidArgument(format!(
                "region at {:#x} already mapped for pid {}",
                start, pid
            )));
        }
        inner.regions.insert(
            (pid.0, start),
            SimRegion {
                len,
                resident: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn unmap(&self, pid: Pid, start: usize, _len: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.regions.remove(&(pid.0, start)).is_none() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn zap_range(&self, pid: Pid, start: usize, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        for ((_, region_start), region) in inner
            .regions
            .iter_mut()
            .filter(|((p, _), _)| *p == pid.0)
        {
            let region_end = region_start + region.len;
            if start >= region_end || start + len <= *region_start {
                continue;
            }
            let keep_below = start.max(*region_start);
            let keep_above = (start + len).min(region_end);
            region.resident.retain(|addr, _| *addr < keep_below || *addr >= keep_above);
        }
    }

    fn insert_page(&self, pid: Pid, addr: usize, pfn: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let region = inner
            .regions
            .iter_mut()
            .find(|((p, region_start), region)| {
                *p == pid.0 && addr >= *region_start && addr < region_start + region.len
            })
            .map(|(_, region)| region)
            .ok_or(Error::NotFound)?;
        region.resident.insert(addr & !(PAGE_SIZE - 1), pfn);
        Ok(())
    }

    fn for_each_resident_page(
        &self,
        pid: Pid,
        start: usize,
        len: usize,
        f: &mut dyn FnMut(usize, u64),
    ) {
        let inner = self.inner.lock().unwrap();
        for ((_, _), region) in inner.regions.iter().filter(|((p, _), _)| *p == pid.0) {
            for (&addr, &pfn) in region.resident.range(start..start + len) {
                f(addr, pfn);
            }
        }
    }

    fn map_physical(&self, _phys: u64, len: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let va = inner.next_kernel_va;
        inner.next_kernel_va += len.max(PAGE_SIZE);
        inner.kernel_windows.insert(va, len);
        Ok(va)
    }

    fn unmap_physical(&self, addr: usize, _len: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.kernel_windows.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: Pid = Pid(42);

    #[test]
    fn test_region_lifecycle() {
        let vs = SimAddressSpace::new();
        vs.map_region(PID, 0x10000, 0x4000).unwrap();
        assert!(vs.is_mapped(PID, 0x10000));

        vs.insert_page(PID, 0x10000, 7).unwrap();
        vs.insert_page(PID, 0x12000, 9).unwrap();
        assert_eq!(vs.resident_pages(PID, 0x10000), Some(2));

        vs.unmap(PID, 0x10000, 0x4000).unwrap();
        assert!(!vs.is_mapped(PID, 0x10000));
    }

    #[test]
    fn test_zap_keeps_region() {
        let vs = SimAddressSpace::new();
        vs.map_region(PID, 0x10000, 0x4000).unwrap();
        vs.insert_page(PID, 0x10000, 7).unwrap();
        vs.insert_page(PID, 0x13000, 8).unwrap();

        vs.zap_range(PID, 0x10000, 0x4000);
        assert!(vs.is_mapped(PID, 0x10000));
        assert_eq!(vs.resident_pages(PID, 0x10000), Some(0));

        // Refault after zap works.
        vs.insert_page(PID, 0x10000, 7).unwrap();
        assert_eq!(vs.resident_pages(PID, 0x10000), Some(1));
    }

    #[test]
    fn test_resident_walk_is_range_limited() {
        let vs = SimAddressSpace::new();
        vs.map_region(PID, 0x10000, 0x4000).unwrap();
        vs.insert_page(PID, 0x10000, 1).unwrap();
        vs.insert_page(PID, 0x11000, 2).unwrap();
        vs.insert_page(PID, 0x13000, 3).unwrap();

        let mut seen = Vec::new();
        vs.for_each_resident_page(PID, 0x10000, 0x2000, &mut |addr, pfn| {
            seen.push((addr, pfn));
        });
        assert_eq!(seen, vec![(0x10000, 1), (0x11000, 2)]);
    }

    #[test]
    fn test_insert_outside_region_fails() {
        let vs = SimAddressSpace::new();
        vs.map_region(PID, 0x10000, 0x1000).unwrap();
        assert!(vs.insert_page(PID, 0x20000, 1).is_err());
    }

    #[test]
    fn test_kernel_windows() {
        let vs = SimAddressSpace::new();
        let va = vs.map_physical(0x3000_0000, 0x2000).unwrap();
        assert_eq!(vs.kernel_windows(), 1);
        vs.unmap_physical(va, 0x2000);
        assert_eq!(vs.kernel_windows(), 0);
    }
}
