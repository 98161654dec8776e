//! Per-resource and global operation statistics.
//!
//! Every resource tracks attempted and failed counts for each operation kind.
//! When a resource is destroyed its counters are rolled up into one of two
//! global accumulators: "deceased" for natural destruction (explicit free)
//! and "terminated" for forced destruction (session close with outstanding
//! resources, or an operation that had to unwind a partially-created
//! resource).

/// Operation kinds tracked by the statistics counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Allocation (including share and the alloc side of import failures).
    Alloc,
    /// Explicit free.
    Free,
    /// Lock against the coprocessor.
    Lock,
    /// Unlock against the coprocessor.
    Unlock,
    /// Address-space mapping.
    Map,
    /// Cache flush (clean counts here as well).
    Flush,
    /// Cache invalidate.
    Invalidate,
    /// External-buffer import.
    Import,
}

impl OpKind {
    /// All kinds, in reporting order.
    pub const ALL: [OpKind; 8] = [
        OpKind::Alloc,
        OpKind::Free,
        OpKind::Lock,
        OpKind::Unlock,
        OpKind::Map,
        OpKind::Flush,
        OpKind::Invalidate,
        OpKind::Import,
    ];

    /// Human-readable label used in statistics reports.
    pub fn label(self) -> &'static str {
        match self {
            OpKind::Alloc => "Alloc",
            OpKind::Free => "Free",
            OpKind::Lock => "Lock",
            OpKind::Unlock => "Unlock",
            OpKind::Map => "Map",
            OpKind::Flush => "Cache Flush",
            OpKind::Invalidate => "Cache Invalidate",
            OpKind::Import => "Import",
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            OpKind::Alloc => 0,
            OpKind::Free => 1,
            OpKind::Lock => 2,
            OpKind::Unlock => 3,
            OpKind::Map => 4,
            OpKind::Flush => 5,
            OpKind::Invalidate => 6,
            OpKind::Import => 7,
        }
    }
}

/// Attempt/failure counters for every operation kind.
#[derive(Clone, Debug, Default)]
pub struct OpStats {
    attempts: [u32; 8],
    failures: [u32; 8],
}

impl OpStats {
    /// Count one attempt of `kind`.
    #[inline]
    pub fn count(&mut self, kind: OpKind) {
        self.attempts[kind.index()] += 1;
    }

    /// Count one failure of `kind`. Failures are counted in addition to the
    /// attempt, at the point the failure is observed.
    #[inline]
    pub fn count_failure(&mut self, kind: OpKind) {
        self.failures[kind.index()] += 1;
    }

    /// Attempts recorded for `kind`.
    #[inline]
    pub fn attempts(&self, kind: OpKind) -> u32 {
        self.attempts[kind.index()]
    }

    /// Failures recorded for `kind`.
    #[inline]
    pub fn failures(&self, kind: OpKind) -> u32 {
        self.failures[kind.index()]
    }

    /// Fold another counter set into this one.
    pub fn merge(&mut self, other: &OpStats) {
        for i in 0..8 {
            self.attempts[i] += other.attempts[i];
            self.failures[i] += other.failures[i];
        }
    }
}

/// One global rollup accumulator (deceased or terminated).
#[derive(Clone, Debug, Default)]
pub struct GlobalStats {
    /// Accumulated per-operation counters of destroyed resources.
    pub stats: OpStats,
    /// Number of resources rolled into this accumulator.
    pub occurrences: u32,
}

impl GlobalStats {
    /// Roll a destroyed resource's counters into this accumulator.
    ///
    /// Called only after the resource has been unlinked from every list, so
    /// a concurrent statistics dump never double counts.
    pub fn absorb(&mut self, stats: &OpStats) {
        self.occurrences += 1;
        self.stats.merge(stats);
    }
}
