//! Diagnostic counters. Updated with relaxed atomics outside of any lock;
//! a snapshot is not a consistent cut.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct PmemStats {
    class_hits: Vec<AtomicU64>,
    class_misses: Vec<AtomicU64>,
    pub splits: AtomicU64,
    pub merges: AtomicU64,
    pub contig_restarts: AtomicU64,
    pub contig_failures: AtomicU64,
    pub reclaim_calls: AtomicU64,
    pub io_pool_hits: AtomicU64,
    pub io_pool_misses: AtomicU64,
    pub io_pool_rejects: AtomicU64,
}

impl PmemStats {
    pub(crate) fn new(classes: usize) -> Self {
        Self {
            class_hits: (0..classes).map(|_| AtomicU64::new(0)).collect(),
            class_misses: (0..classes).map(|_| AtomicU64::new(0)).collect(),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            contig_restarts: AtomicU64::new(0),
            contig_failures: AtomicU64::new(0),
            reclaim_calls: AtomicU64::new(0),
            io_pool_hits: AtomicU64::new(0),
            io_pool_misses: AtomicU64::new(0),
            io_pool_rejects: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn hits(&self, class: usize, pages: u64) {
        Self::add(&self.class_hits[class], pages);
    }

    #[inline]
    pub(crate) fn miss(&self, class: usize) {
        Self::bump(&self.class_misses[class]);
    }

    pub(crate) fn snapshot(&self) -> PmemStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PmemStatsSnapshot {
            class_hits: self.class_hits.iter().map(load).collect(),
            class_misses: self.class_misses.iter().map(load).collect(),
            splits: load(&self.splits),
            merges: load(&self.merges),
            contig_restarts: load(&self.contig_restarts),
            contig_failures: load(&self.contig_failures),
            reclaim_calls: load(&self.reclaim_calls),
            io_pool_hits: load(&self.io_pool_hits),
            io_pool_misses: load(&self.io_pool_misses),
            io_pool_rejects: load(&self.io_pool_rejects),
            ..PmemStatsSnapshot::default()
        }
    }
}

/// Point-in-time copy of the allocator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmemStatsSnapshot {
    /// Pages handed out per range class, ordinary and contiguous.
    pub class_hits: Vec<u64>,
    /// Searches of a range class that came back empty.
    pub class_misses: Vec<u64>,
    /// Large pages split to serve smaller requests.
    pub splits: u64,
    /// Large pages put back together after the request that split them
    /// gave up.
    pub merges: u64,
    /// Contiguous runs abandoned part way and restarted.
    pub contig_restarts: u64,
    /// Contiguous requests that failed for good.
    pub contig_failures: u64,
    pub reclaim_calls: u64,
    /// Contiguous requests served from the reserve.
    pub io_pool_hits: u64,
    /// Contiguous requests the reserve could have served but did not.
    pub io_pool_misses: u64,
    /// Reserve candidates rejected as not idle.
    pub io_pool_rejects: u64,
    pub io_pool_count: usize,
    pub io_pool_min: usize,
    pub io_pool_max: usize,
    pub io_pool_low_water: usize,
    pub free_pages: usize,
}
