//! # IO pool reserve
//!
//! A sorted array of low, idle, free frames set aside so that small
//! contiguous DMA requests can be served by a binary search instead of a
//! walk over the free lists. Frames in the reserve are owned by it: they are
//! flagged `io_pool` in their descriptor and are on no free list.
//!
//! The reserve is kept between `min` and `max` frames. When a fast-path
//! allocation leaves it below `low_water` and the caller may block, it is
//! topped up again.

use crate::color::ColorEquivalence;
use crate::config::IoPoolConfig;
use crate::error::{ConfigError, invariant_violation};
use crate::page::PageRun;
use crate::pfn::Pfn;
use crate::pmem::PhysMem;
use crate::range::RangeOrdering;
use crate::stats::PmemStats;
use crate::vm::VmLayer;
use alloc::vec::Vec;
use log::{debug, warn};

/// Watermarks of the reserve, in pages.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IoPoolTunables {
    pub min: usize,
    pub max: usize,
    pub low_water: usize,
}

impl IoPoolTunables {
    /// Fill the blanks of `cfg` for `managed` pages of memory.
    #[must_use]
    pub fn derive(cfg: &IoPoolConfig, managed: u64) -> Self {
        let min = cfg.min;
        let pct = usize::try_from(managed / 100 * cfg.pct as u64).unwrap_or(usize::MAX);
        let max = cfg.max.unwrap_or_else(|| pct.max(min));
        let low_water = cfg.low_water.unwrap_or((min + max) / 2);
        Self { min, max, low_water }
    }

    /// # Errors
    /// [`ConfigError::IoPoolWatermarks`] unless `min <= low_water <= max`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min <= self.low_water && self.low_water <= self.max {
            Ok(())
        } else {
            Err(ConfigError::IoPoolWatermarks {
                min: self.min,
                low_water: self.low_water,
                max: self.max,
            })
        }
    }
}

/// Address-ordered frames of the reserve.
///
/// ### Examples
/// ```rust
/// # use kernel_pmem::*;
/// let mut r = IoPoolReserve::new(IoPoolTunables::default());
/// for pfn in [7, 3, 4, 5, 6] {
///     r.insert(Pfn::new(pfn));
/// }
/// let start = r.find_run(3, Pfn::new(0), Pfn::new(100), 2, 0).unwrap();
/// assert_eq!(start, Pfn::new(4));
/// assert_eq!(r.excise(3, start), Some(PageRun::new(Pfn::new(4), 3)));
/// assert_eq!(r.frames(), &[Pfn::new(3), Pfn::new(7)]);
/// ```
#[derive(Debug, Clone)]
pub struct IoPoolReserve {
    frames: Vec<Pfn>,
    tunables: IoPoolTunables,
    /// Watermarks were set by an administrator, not derived.
    explicit: bool,
}

impl IoPoolReserve {
    #[must_use]
    pub const fn new(tunables: IoPoolTunables) -> Self {
        Self {
            frames: Vec::new(),
            tunables,
            explicit: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[Pfn] {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn tunables(&self) -> IoPoolTunables {
        self.tunables
    }

    /// Insert in address order. Returns `false` if `pfn` is already held.
    pub fn insert(&mut self, pfn: Pfn) -> bool {
        match self.frames.binary_search(&pfn) {
            Ok(_) => false,
            Err(i) => {
                self.frames.insert(i, pfn);
                true
            }
        }
    }

    /// First frame of `n` consecutive held frames inside `[lo, hi]`, starting
    /// on a multiple of `align` and not crossing a multiple of `seg` (`0`
    /// for no segment limit).
    #[must_use]
    pub fn find_run(&self, n: u64, lo: Pfn, hi: Pfn, align: u64, seg: u64) -> Option<Pfn> {
        let first = self.frames.partition_point(|&p| p < lo);
        let mut start: Option<usize> = None;

        for i in first..self.frames.len() {
            let p = self.frames[i];
            if p > hi {
                break;
            }
            let continues = start.is_some() && p == self.frames[i - 1] + 1;
            if !continues {
                start = (p.is_aligned(align) && fits_segment(p, n, seg)).then_some(i);
            }
            if let Some(s) = start
                && (i - s + 1) as u64 == n
            {
                return Some(self.frames[s]);
            }
        }
        None
    }

    /// Remove the `n` consecutive frames starting at `start`.
    pub fn excise(&mut self, n: u64, start: Pfn) -> Option<PageRun> {
        let i = self.frames.binary_search(&start).ok()?;
        let end = i + usize::try_from(n).ok()?;
        if n == 0 || end > self.frames.len() || self.frames[end - 1] != start + (n - 1) {
            return None;
        }
        self.frames.drain(i..end);
        Some(PageRun::new(start, n))
    }

    /// Remove everything above the first `keep` frames, highest first.
    pub fn split_above(&mut self, keep: usize) -> Vec<Pfn> {
        if self.frames.len() <= keep {
            return Vec::new();
        }
        let mut tail = self.frames.split_off(keep);
        tail.reverse();
        tail
    }

    /// Strictly increasing.
    ///
    /// # Errors
    /// The first frame that is not above its predecessor.
    pub fn check_sorted(&self) -> Result<(), Pfn> {
        match self.frames.windows(2).find(|w| w[0] >= w[1]) {
            Some(w) => Err(w[1]),
            None => Ok(()),
        }
    }

    pub(crate) fn rederive(&mut self, cfg: &IoPoolConfig, managed: u64) {
        if !self.explicit {
            self.tunables = IoPoolTunables::derive(cfg, managed);
        }
    }

    pub(crate) fn set_tunables(&mut self, tunables: IoPoolTunables) {
        self.tunables = tunables;
        self.explicit = true;
    }
}

#[inline]
const fn fits_segment(start: Pfn, n: u64, seg: u64) -> bool {
    seg == 0 || start.as_u64() / seg == (start.as_u64() + n - 1) / seg
}

impl<V: VmLayer, O: RangeOrdering, E: ColorEquivalence> PhysMem<V, O, E> {
    /// Set the reserve watermarks. Takes effect on the next population or
    /// shrink; frames already held are kept.
    ///
    /// # Errors
    /// [`ConfigError::IoPoolWatermarks`] unless `min <= low_water <= max`.
    pub fn io_pool_configure(
        &self,
        min: usize,
        max: usize,
        low_water: usize,
    ) -> Result<(), ConfigError> {
        let tunables = IoPoolTunables {
            min,
            max,
            low_water,
        };
        tunables.validate()?;
        self.reserve.lock().set_tunables(tunables);
        debug!("pmem: IO pool watermarks min {min} low {low_water} max {max}");
        Ok(())
    }

    /// Grow the reserve towards `target` frames (capped at `max`) with the
    /// lowest free idle frames of the reserve window. Returns the number of
    /// frames added.
    pub fn io_pool_populate(&self, target: usize) -> usize {
        let want = {
            let r = self.reserve.lock();
            target.min(r.tunables().max).saturating_sub(r.len())
        };
        if want == 0 {
            return 0;
        }

        let window = &self.config.io_pool;
        let topo = self.topology();
        let mut ranges = topo.ranges.intersecting(window.window_lo, window.window_hi);
        ranges.sort_by_key(|c| c.lo);

        let mut added = 0;
        let mut rejected = 0;
        let mut splits = Vec::new();
        'ranges: for c in &ranges {
            let Some(pool) = topo.pool(c.node) else {
                continue;
            };
            let mut cursor = c.lo;
            while added < want {
                let taken = pool.lists.lock().take_first_free(cursor, c.hi, 1, &mut splits);
                let Some(pfn) = taken else {
                    continue 'ranges;
                };
                cursor = pfn + 1;

                if !self.vm.is_idle(pfn) {
                    pool.lists.lock().release(pfn, 1);
                    rejected += 1;
                    continue;
                }

                pool.lists.lock().mark_reserved(pfn);
                let inserted = {
                    let mut r = self.reserve.lock();
                    (r.len() < target.min(r.tunables().max)).then(|| r.insert(pfn))
                };
                match inserted {
                    Some(true) => added += 1,
                    Some(false) => invariant_violation!("frame {pfn} reserved twice"),
                    None => {
                        // Filled up concurrently.
                        pool.lists.lock().unreserve(pfn);
                        break 'ranges;
                    }
                }
            }
            break;
        }
        // Large pages that gave up no frame to the reserve are whole again.
        self.restore_splits(&topo, splits);

        if rejected > 0 {
            warn!("pmem: IO pool skipped {rejected} frames that are not idle");
            PmemStats::add(&self.stats.io_pool_rejects, rejected);
        }
        debug!("pmem: IO pool populated with {added} of {want} frames");
        added
    }

    /// Give frames beyond `target` back to the free lists, highest first.
    /// Returns the number of frames released.
    pub fn io_pool_shrink(&self, target: usize) -> usize {
        let frames = self.reserve.lock().split_above(target);
        if frames.is_empty() {
            return 0;
        }

        let topo = self.topology();
        for &pfn in &frames {
            let Some(pool) = topo.pool_for(pfn) else {
                invariant_violation!("reserve frame {pfn} belongs to no node");
            };
            pool.lists.lock().unreserve(pfn);
        }
        debug!("pmem: IO pool shrunk by {} frames", frames.len());
        frames.len()
    }

    /// Idle-time upkeep: refill to the low-water mark when below it, trim to
    /// `max` when above.
    pub fn io_pool_maintain(&self) {
        let (len, t) = {
            let r = self.reserve.lock();
            (r.len(), r.tunables())
        };
        if len < t.low_water {
            self.io_pool_populate(t.low_water);
        } else if len > t.max {
            self.io_pool_shrink(t.max);
        }
    }

    /// Whether a contiguous request of `want` pages is small enough to try
    /// the reserve: at most `max_request` pages and at most one segment.
    pub(crate) const fn reserve_serves(&self, want: u64, seg: u64) -> bool {
        let max = self.config.io_pool.max_request;
        want <= max && (seg == 0 || want <= seg)
    }

    /// Serve a contiguous request from the reserve, without blocking.
    pub(crate) fn contig_from_reserve(
        &self,
        want: u64,
        lo: Pfn,
        hi: Pfn,
        align: u64,
        seg: u64,
        may_block: bool,
    ) -> Option<PageRun> {
        let run = {
            let mut r = self.reserve.lock();
            if (r.len() as u64) < want {
                None
            } else {
                r.find_run(want, lo, hi, align, seg)
                    .and_then(|start| r.excise(want, start))
            }
        }?;

        let topo = self.topology();
        for pfn in run.iter() {
            let Some(pool) = topo.pool_for(pfn) else {
                invariant_violation!("reserve frame {pfn} belongs to no node");
            };
            pool.lists.lock().claim_reserved(pfn);
        }
        PmemStats::bump(&self.stats.io_pool_hits);
        self.stats
            .hits(topo.ranges.classes().class_of(run.start), want);
        debug!("pmem: {want} contiguous pages at {} from the IO pool", run.start);

        let (len, low_water) = {
            let r = self.reserve.lock();
            (r.len(), r.tunables().low_water)
        };
        if may_block && len < low_water {
            self.io_pool_populate(low_water);
        }
        Some(run)
    }
}
