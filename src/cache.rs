//! Cache maintenance primitives and range walkers.
//!
//! Host-cached shared memory has to be cleaned before the coprocessor reads
//! it and invalidated before the host rereads what the coprocessor wrote.
//! [`CachePrimitives`] abstracts the architecture-level operations; the
//! manager composes them over mapped ranges and resident pages.
//! [`RecordingCache`] logs every call so tests can assert exactly which
//! ranges were maintained.

use crate::error::{Error, Result};
use crate::types::Pid;
use std::sync::{Arc, Mutex};

/// A cache maintenance operation, as carried in maintenance batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOp {
    /// No operation. Terminates a maintenance batch.
    Nop,
    /// Discard cache lines without writing them back.
    Invalidate,
    /// Write dirty lines back without discarding them.
    Clean,
    /// Write back and discard.
    Flush,
}

impl CacheOp {
    /// Decode a raw operation code from a maintenance request.
    pub fn from_raw(raw: u32) -> Result<CacheOp> {
        match raw {
            0 => Ok(CacheOp::Nop),
            1 => Ok(CacheOp::Invalidate),
            2 => Ok(CacheOp::Clean),
            3 => Ok(CacheOp::Flush),
            other => Err(Error::InvalidArgument(format!(
                "unknown cache operation {}",
                other
            ))),
        }
    }
}

/// Architecture-level cache operations.
///
/// Virtual-range operations act on a process's view; the `outer_*` pair acts
/// on the outer (L2) cache by physical address.
pub trait CachePrimitives: Send + Sync {
    /// Invalidate a virtual range.
    fn inv_range(&self, pid: Pid, start: usize, len: usize);
    /// Clean a virtual range.
    fn clean_range(&self, pid: Pid, start: usize, len: usize);
    /// Clean and invalidate a virtual range.
    fn flush_range(&self, pid: Pid, start: usize, len: usize);
    /// Invalidate a physical range in the outer cache.
    fn outer_inv(&self, phys: u64, len: usize);
    /// Clean a physical range in the outer cache.
    fn outer_clean(&self, phys: u64, len: usize);
}

/// Apply `op` to a single virtual range. `Nop` succeeds without touching
/// anything.
pub fn apply_range(
    cache: &dyn CachePrimitives,
    op: CacheOp,
    pid: Pid,
    start: usize,
    len: usize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    match op {
        CacheOp::Nop => {}
        CacheOp::Invalidate => cache.inv_range(pid, start, len),
        CacheOp::Clean => cache.clean_range(pid, start, len),
        CacheOp::Flush => cache.flush_range(pid, start, len),
    }
    Ok(())
}

/// Apply `op` to a pinned 2D block layout: `block_count` blocks of
/// `block_size` bytes, the start of each block `stride` bytes after the
/// previous one. Used for maintaining image planes without touching the
/// padding between rows.
pub fn apply_2d(
    cache: &dyn CachePrimitives,
    op: CacheOp,
    pid: Pid,
    base: usize,
    block_count: usize,
    block_size: usize,
    stride: usize,
) -> Result<()> {
    if op == CacheOp::Nop || block_count == 0 || block_size == 0 {
        return Ok(());
    }
    for i in 0..block_count {
        apply_range(cache, op, pid, base + i * stride, block_size)?;
    }
    Ok(())
}

/// A virtual-range maintenance call seen by [`RecordingCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheCall {
    /// Operation applied.
    pub op: CacheOp,
    /// Address space the range belongs to.
    pub pid: Pid,
    /// Range start.
    pub start: usize,
    /// Range length in bytes.
    pub len: usize,
}

#[derive(Debug, Default)]
struct RecordingInner {
    calls: Vec<CacheCall>,
    outer: Vec<(CacheOp, u64, usize)>,
}

/// [`CachePrimitives`] implementation that records every call.
#[derive(Clone, Default)]
pub struct RecordingCache {
    inner: Arc<Mutex<RecordingInner>>,
}

impl RecordingCache {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual-range calls recorded so far, in order.
    pub fn calls(&self) -> Vec<CacheCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Outer-cache calls recorded so far, in order.
    pub fn outer_calls(&self) -> Vec<(CacheOp, u64, usize)> {
        self.inner.lock().unwrap().outer.clone()
    }

    fn record(&self, op: CacheOp, pid: Pid, start: usize, len: usize) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(CacheCall { op, pid, start, len });
    }
}

impl CachePrimitives for RecordingCache {
    fn inv_range(&self, pid: Pid, start: usize, len: usize) {
        self.record(CacheOp::Invalidate, pid, start, len);
    }

    fn clean_range(&self, pid: Pid, start: usize, len: usize) {
        self.record(CacheOp::Clean, pid, start, len);
    }

    fn flush_range(&self, pid: Pid, start: usize, len: usize) {
        self.record(CacheOp::Flush, pid, start, len);
    }

    fn outer_inv(&self, phys: u64, len: usize) {
        self.inner
            .lock()
            .unwrap()
            .outer
            .push((CacheOp::Invalidate, phys, len));
    }

    fn outer_clean(&self, phys: u64, len: usize) {
        self.inner
            .lock()
            .unwrap()
            .outer
            .push((CacheOp::Clean, phys, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: Pid = Pid(7);

    #[test]
    fn test_op_decoding() {
        assert_eq!(CacheOp::from_raw(0).unwrap(), CacheOp::Nop);
        assert_eq!(CacheOp::from_raw(3).unwrap(), CacheOp::Flush);
        assert!(CacheOp::from_raw(4).is_err());
    }

    #[test]
    fn test_nop_touches_nothing() {
        let cache = RecordingCache::new();
        apply_range(&cache, CacheOp::Nop, PID, 0x1000, 0x1000).unwrap();
        assert!(cache.calls().is_empty());
    }

    #[test]
    fn test_2d_walk_strides_blocks() {
        let cache = RecordingCache::new();
        apply_2d(&cache, CacheOp::Clean, PID, 0x1000, 3, 0x100, 0x400).unwrap();
        let calls = cache.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].start, 0x1000);
        assert_eq!(calls[1].start, 0x1400);
        assert_eq!(calls[2].start, 0x1800);
        assert!(calls.iter().all(|c| c.len == 0x100 && c.op == CacheOp::Clean));
    }

    #[test]
    fn test_empty_range_is_skipped() {
        let cache = RecordingCache::new();
        apply_range(&cache, CacheOp::Flush, PID, 0x1000, 0).unwrap();
        apply_2d(&cache, CacheOp::Flush, PID, 0x1000, 0, 0x100, 0x100).unwrap();
        assert!(cache.calls().is_empty());
    }
}
