//! # Contiguous allocation
//!
//! DMA engines without scatter/gather need physically contiguous buffers
//! inside an address window they can reach. A request first tries the IO
//! pool reserve and then walks the candidate ranges, growing a run one free
//! page at a time:
//!
//! ```text
//! range  ..  98  99 [100 101 102 103] 104 ..
//!                     ^ aligned start       ^ run complete at len 4
//!
//! gap    ..  [100 101] x 103 ..       -> give 100, 101 back, restart after 102
//! ```
//!
//! Pages of a run under construction are taken off the free lists one by
//! one, each under a short hold of the node lock, and returned to them
//! whenever the run has to be abandoned. Large pages broken up for the run
//! are merged again when it is abandoned.

use crate::color::ColorEquivalence;
use crate::error::PmemError;
use crate::freelist::Split;
use crate::page::PageRun;
use crate::pfn::{PAGE_SIZE, Pfn};
use crate::pmem::{NodePool, PhysMem, Topology};
use crate::range::{RangeCandidate, RangeOrdering};
use crate::stats::PmemStats;
use crate::vm::VmLayer;
use alloc::vec::Vec;
use log::{debug, warn};

/// What a device can address.
///
/// Byte bounds are inclusive; alignment, segment length and granularity are
/// in pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConstraint {
    pub addr_lo: u64,
    pub addr_hi: u64,
    /// Run start must be a multiple of this; a power of two.
    pub align: u64,
    /// A run may not cross a multiple of this; `0` for no limit.
    pub max_segment: u64,
    /// Runs are rounded up to a multiple of this.
    pub granularity: u64,
}

impl DmaConstraint {
    #[must_use]
    pub const fn new(addr_lo: u64, addr_hi: u64) -> Self {
        Self {
            addr_lo,
            addr_hi,
            align: 1,
            max_segment: 0,
            granularity: 1,
        }
    }

    /// ISA-style devices.
    #[must_use]
    pub const fn below_16m() -> Self {
        Self::new(0, (16 << 20) - 1)
    }

    /// 32-bit devices.
    #[must_use]
    pub const fn below_4g() -> Self {
        Self::new(0, (4 << 30) - 1)
    }

    #[must_use]
    pub const fn any() -> Self {
        Self::new(0, u64::MAX)
    }

    #[must_use]
    pub const fn with_align(mut self, pages: u64) -> Self {
        self.align = pages;
        self
    }

    #[must_use]
    pub const fn with_max_segment(mut self, pages: u64) -> Self {
        self.max_segment = pages;
        self
    }

    #[must_use]
    pub const fn with_granularity(mut self, pages: u64) -> Self {
        self.granularity = pages;
        self
    }

    /// Frames lying entirely inside the byte window, `[lo, hi]`.
    ///
    /// ### Examples
    /// ```rust
    /// # use kernel_pmem::*;
    /// let (lo, hi) = DmaConstraint::new(0x1001, 16 << 20).window().unwrap();
    /// assert_eq!((lo, hi), (Pfn::new(2), Pfn::new(0xFFF)));
    /// assert_eq!(
    ///     DmaConstraint::new(0x1001, 0x1FFE).window(),
    ///     Err(PmemError::ConstraintUnsatisfiable)
    /// );
    /// ```
    ///
    /// # Errors
    /// - [`PmemError::InvalidConstraint`] for a malformed constraint.
    /// - [`PmemError::ConstraintUnsatisfiable`] if no whole frame fits.
    pub fn window(&self) -> Result<(Pfn, Pfn), PmemError> {
        if !self.align.is_power_of_two() {
            return Err(PmemError::InvalidConstraint("alignment must be a power of two"));
        }
        if self.max_segment != 0 && !self.max_segment.is_power_of_two() {
            return Err(PmemError::InvalidConstraint("segment length must be a power of two"));
        }
        if self.granularity == 0 {
            return Err(PmemError::InvalidConstraint("granularity must be at least one page"));
        }
        if self.addr_lo > self.addr_hi {
            return Err(PmemError::InvalidConstraint("inverted address window"));
        }

        let lo = self.addr_lo.div_ceil(PAGE_SIZE);
        let hi = match self.addr_hi.checked_add(1) {
            Some(end) => (end / PAGE_SIZE).checked_sub(1),
            None => Some(u64::MAX / PAGE_SIZE),
        };
        match hi {
            Some(hi) if lo <= hi => Ok((Pfn::new(lo), Pfn::new(hi))),
            _ => Err(PmemError::ConstraintUnsatisfiable),
        }
    }

    /// `npages` rounded up to the granularity, or `None` if that does not
    /// fit in a `u64` or the granularity is zero.
    ///
    /// ### Examples
    /// ```rust
    /// # use kernel_pmem::*;
    /// let c = DmaConstraint::any().with_granularity(4);
    /// assert_eq!(c.round(5), Some(8));
    /// assert_eq!(c.round(u64::MAX), None);
    /// ```
    #[inline]
    #[must_use]
    pub const fn round(&self, npages: u64) -> Option<u64> {
        if self.granularity == 0 {
            return None;
        }
        npages
            .div_ceil(self.granularity)
            .checked_mul(self.granularity)
    }
}

impl<V: VmLayer, O: RangeOrdering, E: ColorEquivalence> PhysMem<V, O, E> {
    /// Allocate `npages` physically contiguous base pages satisfying
    /// `constraint`.
    ///
    /// Requests no configured memory could ever satisfy fail right away with
    /// [`PmemError::ConstraintUnsatisfiable`]. Otherwise a caller that may
    /// not block gets [`PmemError::WouldBlock`] after one search, and one
    /// that may block gets [`PmemError::InsufficientMemory`] once every
    /// attempt, each followed by a reclaim request, came back empty.
    ///
    /// # Errors
    /// - [`PmemError::InvalidConstraint`] for a malformed constraint or an
    ///   empty request.
    /// - [`PmemError::ConstraintUnsatisfiable`] if the rounded request is
    ///   longer than the segment limit or than every range in the window.
    /// - [`PmemError::WouldBlock`] and [`PmemError::InsufficientMemory`] as
    ///   described above.
    pub fn alloc_contig(
        &self,
        npages: u64,
        constraint: DmaConstraint,
        may_block: bool,
    ) -> Result<PageRun, PmemError> {
        let (lo, hi) = constraint.window()?;
        if npages == 0 {
            return Err(PmemError::InvalidConstraint("empty request"));
        }
        let want = constraint
            .round(npages)
            .ok_or(PmemError::ConstraintUnsatisfiable)?;
        let seg = constraint.max_segment;
        if seg != 0 && want > seg {
            return Err(PmemError::ConstraintUnsatisfiable);
        }

        let topo = self.topology();
        let mut candidates = topo.ranges.intersecting(lo, hi);
        // A run never spans two range descriptors.
        if candidates.iter().all(|c| c.span() < want) {
            return Err(PmemError::ConstraintUnsatisfiable);
        }
        self.ordering.order(&mut candidates);

        let use_reserve = self.reserve_serves(want, seg);
        let limit = self.config.contig_retry_limit;
        for attempt in 1..=limit {
            if use_reserve {
                match self.contig_from_reserve(want, lo, hi, constraint.align, seg, may_block) {
                    Some(run) => return Ok(run),
                    // One miss per request, not per attempt.
                    None if attempt == 1 => PmemStats::bump(&self.stats.io_pool_misses),
                    None => {}
                }
            }
            if let Some(run) = self.contig_search(&topo, &candidates, want, constraint.align, seg)
            {
                return Ok(run);
            }
            if !may_block {
                PmemStats::bump(&self.stats.contig_failures);
                debug!("pmem: {want} contiguous pages unavailable, caller cannot wait");
                return Err(PmemError::WouldBlock);
            }

            warn!("pmem: {want} contiguous pages unavailable, reclaiming (attempt {attempt}/{limit})");
            self.reclaim(want);
        }

        PmemStats::bump(&self.stats.contig_failures);
        warn!("pmem: giving up on {want} contiguous pages after {limit} attempts");
        Err(PmemError::InsufficientMemory)
    }

    fn contig_search(
        &self,
        topo: &Topology,
        candidates: &[RangeCandidate],
        want: u64,
        align: u64,
        seg: u64,
    ) -> Option<PageRun> {
        for c in candidates.iter().filter(|c| c.span() >= want) {
            let Some(pool) = topo.pool(c.node) else {
                continue;
            };
            if let Some(start) = self.search_range(pool, c.lo, c.hi, want, align, seg) {
                self.stats.hits(c.class, want);
                debug!(
                    "pmem: {want} contiguous pages at {start} on {} class {}",
                    c.node, c.class
                );
                return Some(PageRun::new(start, want));
            }
            self.stats.miss(c.class);
        }
        None
    }

    /// Grow a run inside `[lo, hi]` of one node. On success every page of
    /// the run is allocated; on failure nothing is.
    fn search_range(
        &self,
        pool: &NodePool,
        lo: Pfn,
        hi: Pfn,
        want: u64,
        align: u64,
        seg: u64,
    ) -> Option<Pfn> {
        let mut cursor = lo;
        let mut run: Option<(Pfn, u64)> = None;
        // Large pages split by the run under construction.
        let mut splits = Vec::new();

        loop {
            match run {
                Some((start, len)) if len == want => return Some(start),
                Some((start, len)) => {
                    let next = start + len;
                    if next > hi {
                        self.abandon(pool, start, len, &mut splits);
                        return None;
                    }
                    let extended = pool.lists.lock().take_if_free(next, &mut splits);
                    if extended {
                        run = Some((start, len + 1));
                    } else {
                        self.abandon(pool, start, len, &mut splits);
                        PmemStats::bump(&self.stats.contig_restarts);
                        run = None;
                        cursor = next + 1;
                    }
                }
                None => {
                    let taken = pool
                        .lists
                        .lock()
                        .take_first_free(cursor, hi, align, &mut splits);
                    let start = taken?;
                    if start + (want - 1) > hi {
                        self.abandon(pool, start, 1, &mut splits);
                        return None;
                    }
                    if seg != 0 && start.as_u64() / seg != (start.as_u64() + want - 1) / seg {
                        self.abandon(pool, start, 1, &mut splits);
                        PmemStats::bump(&self.stats.contig_restarts);
                        cursor = Pfn::new((start.as_u64() / seg + 1) * seg);
                        continue;
                    }
                    run = Some((start, 1));
                }
            }
        }
    }

    fn abandon(&self, pool: &NodePool, start: Pfn, len: u64, splits: &mut Vec<Split>) {
        let merged = pool.lists.lock().abandon(start, len, splits);
        if merged > 0 {
            PmemStats::add(&self.stats.merges, merged as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_inclusive_and_page_granular() {
        let c = DmaConstraint::below_16m();
        assert_eq!(c.window(), Ok((Pfn::new(0), Pfn::new(0xFFF))));

        // A high bound on the first byte of a page excludes that page.
        let c = DmaConstraint::new(0, 16 << 20);
        assert_eq!(c.window(), Ok((Pfn::new(0), Pfn::new(0xFFF))));

        let c = DmaConstraint::any();
        assert_eq!(c.window(), Ok((Pfn::new(0), Pfn::new(u64::MAX >> 12))));

        let c = DmaConstraint::new(0, 0xFFE);
        assert_eq!(c.window(), Err(PmemError::ConstraintUnsatisfiable));
    }

    #[test]
    fn rejects_malformed_constraints() {
        assert!(matches!(
            DmaConstraint::any().with_align(3).window(),
            Err(PmemError::InvalidConstraint(_))
        ));
        assert!(matches!(
            DmaConstraint::any().with_max_segment(48).window(),
            Err(PmemError::InvalidConstraint(_))
        ));
        assert!(matches!(
            DmaConstraint::any().with_granularity(0).window(),
            Err(PmemError::InvalidConstraint(_))
        ));
        assert!(matches!(
            DmaConstraint::new(10, 5).window(),
            Err(PmemError::InvalidConstraint(_))
        ));
    }

    #[test]
    fn granularity_rounds_up() {
        let c = DmaConstraint::any().with_granularity(4);
        assert_eq!(c.round(1), Some(4));
        assert_eq!(c.round(4), Some(4));
        assert_eq!(c.round(5), Some(8));
        assert_eq!(DmaConstraint::any().round(3), Some(3));
        assert_eq!(DmaConstraint::any().round(u64::MAX), Some(u64::MAX));
    }

    #[test]
    fn rounding_overflow_is_caught() {
        let c = DmaConstraint::any().with_granularity(2);
        assert_eq!(c.round(u64::MAX), None);
        assert_eq!(c.round(u64::MAX - 1), Some(u64::MAX - 1));
        assert_eq!(DmaConstraint::any().with_granularity(0).round(1), None);
    }
}
