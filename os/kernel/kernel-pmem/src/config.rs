//! Compile-time defaults and the boot-time [`PmemConfig`].

use crate::error::ConfigError;
use crate::pfn::{NodeId, PFN_4G, Pfn};
use crate::range::RangeClasses;

/// Smallest number of page colors the allocator distinguishes.
pub const PAGE_COLORS_MIN: u32 = 16;

/// Default lower bound of the IO pool reserve, in pages.
pub const DEFAULT_IO_POOL_MIN: usize = 128;

/// Default upper bound of the IO pool reserve, in percent of managed pages.
pub const DEFAULT_IO_POOL_PCT: usize = 2;

/// Largest contiguous request the reserve serves by default, in pages.
pub const DEFAULT_IO_POOL_MAX_REQUEST: u64 = 64;

/// Free pages below 16 MiB that ordinary allocations leave alone.
pub const DEFAULT_DESFREE_LOW: usize = 0x380;

/// Ordinary allocations leave memory below 4 GiB alone while no more than
/// this fraction of it, as a right shift of the pages managed there, is free.
pub const DEFAULT_DESFREE_4G_SHIFT: u32 = 4;

/// Attempts made by a blocking contiguous allocation before giving up.
pub const DEFAULT_CONTIG_RETRY_LIMIT: u32 = 3;

/// Upper bound on the number of size classes.
pub const MAX_SIZE_CLASSES: usize = 4;

/// Page shifts relative to the base page: 4 KiB and 2 MiB.
pub const DEFAULT_SIZE_CLASS_SHIFTS: &[u32] = &[0, 9];

const _: () = assert!(PAGE_COLORS_MIN.is_power_of_two());
const _: () = assert!(DEFAULT_IO_POOL_PCT > 0 && DEFAULT_IO_POOL_PCT < 100);
const _: () = assert!(DEFAULT_CONTIG_RETRY_LIMIT >= 1);
const _: () = assert!(DEFAULT_SIZE_CLASS_SHIFTS.len() <= MAX_SIZE_CLASSES);
const _: () = assert!(DEFAULT_SIZE_CLASS_SHIFTS[0] == 0);

/// Extent of one NUMA node, `[base, max]` inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node: NodeId,
    pub base: Pfn,
    pub max: Pfn,
}

impl NodeConfig {
    #[inline]
    #[must_use]
    pub const fn new(node: u16, base: u64, max: u64) -> Self {
        Self {
            node: NodeId(node),
            base: Pfn::new(base),
            max: Pfn::new(max),
        }
    }

    /// Number of frames in the extent.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.max.as_u64() - self.base.as_u64() + 1
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.base.as_u64() && pfn.as_u64() <= self.max.as_u64()
    }
}

/// Initial sizing of the IO pool reserve.
///
/// `max` and `low_water` left as `None` are derived from the number of
/// managed pages every time memory is seeded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoPoolConfig {
    pub min: usize,
    pub max: Option<usize>,
    pub low_water: Option<usize>,
    pub pct: usize,
    /// Lowest frame the reserve may hold.
    pub window_lo: Pfn,
    /// Highest frame the reserve may hold.
    pub window_hi: Pfn,
    /// Largest contiguous request tried against the reserve, in pages.
    pub max_request: u64,
}

impl IoPoolConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min: DEFAULT_IO_POOL_MIN,
            max: None,
            low_water: None,
            pct: DEFAULT_IO_POOL_PCT,
            window_lo: Pfn::new(0),
            window_hi: Pfn::new(PFN_4G - 1),
            max_request: DEFAULT_IO_POOL_MAX_REQUEST,
        }
    }
}

impl Default for IoPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator configuration, validated once by [`PhysMem::new`](crate::PhysMem::new).
///
/// ### Examples
/// ```rust
/// # use kernel_pmem::*;
/// let cfg = PmemConfig::new()
///     .with_page_colors(64)
///     .with_cpu_page_colors(16)
///     .with_contig_retry_limit(5);
/// assert!(cfg.validate().is_ok());
/// assert!(PmemConfig::new().with_page_colors(12).validate().is_err());
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PmemConfig {
    /// Number of colors of the base size class.
    pub page_colors: u32,
    /// Colors the CPU caches distinguish; `0` means the same as `page_colors`.
    pub cpu_page_colors: u32,
    /// Width of a color equivalence class; `0` and `1` disable it.
    pub color_equiv: u32,
    /// Page shift of each size class relative to the base page.
    pub size_classes: &'static [u32],
    pub range_classes: RangeClasses,
    pub desfree_low: usize,
    /// Reserve below 4 GiB is `managed_below_4g >> desfree_4g_shift` pages
    /// per node; `64` or more turns it off. Only nodes that also have memory
    /// above 4 GiB hold it back.
    pub desfree_4g_shift: u32,
    pub contig_retry_limit: u32,
    pub io_pool: IoPoolConfig,
}

impl PmemConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_colors: PAGE_COLORS_MIN,
            cpu_page_colors: 0,
            color_equiv: 0,
            size_classes: DEFAULT_SIZE_CLASS_SHIFTS,
            range_classes: RangeClasses::x86(),
            desfree_low: DEFAULT_DESFREE_LOW,
            desfree_4g_shift: DEFAULT_DESFREE_4G_SHIFT,
            contig_retry_limit: DEFAULT_CONTIG_RETRY_LIMIT,
            io_pool: IoPoolConfig::new(),
        }
    }

    #[must_use]
    pub const fn with_page_colors(mut self, colors: u32) -> Self {
        self.page_colors = colors;
        self
    }

    #[must_use]
    pub const fn with_cpu_page_colors(mut self, colors: u32) -> Self {
        self.cpu_page_colors = colors;
        self
    }

    #[must_use]
    pub const fn with_color_equiv(mut self, equiv: u32) -> Self {
        self.color_equiv = equiv;
        self
    }

    #[must_use]
    pub const fn with_size_classes(mut self, shifts: &'static [u32]) -> Self {
        self.size_classes = shifts;
        self
    }

    #[must_use]
    pub const fn with_range_classes(mut self, classes: RangeClasses) -> Self {
        self.range_classes = classes;
        self
    }

    #[must_use]
    pub const fn with_desfree_low(mut self, pages: usize) -> Self {
        self.desfree_low = pages;
        self
    }

    #[must_use]
    pub const fn with_desfree_4g_shift(mut self, shift: u32) -> Self {
        self.desfree_4g_shift = shift;
        self
    }

    /// Free pages below 4 GiB a node keeps back from ordinary allocations,
    /// given the pages it manages there.
    ///
    /// ### Examples
    /// ```rust
    /// # use kernel_pmem::*;
    /// assert_eq!(PmemConfig::new().desfree_4g(0x10_0000), 0x1_0000);
    /// assert_eq!(PmemConfig::new().with_desfree_4g_shift(64).desfree_4g(0x10_0000), 0);
    /// ```
    #[inline]
    #[must_use]
    pub const fn desfree_4g(&self, managed_below_4g: usize) -> usize {
        match managed_below_4g.checked_shr(self.desfree_4g_shift) {
            Some(pages) => pages,
            None => 0,
        }
    }

    #[must_use]
    pub const fn with_contig_retry_limit(mut self, attempts: u32) -> Self {
        self.contig_retry_limit = attempts;
        self
    }

    #[must_use]
    pub const fn with_io_pool(mut self, io_pool: IoPoolConfig) -> Self {
        self.io_pool = io_pool;
        self
    }

    /// Equivalence shift from a CPU that distinguishes fewer colors, plus
    /// the `color_equiv` tunable.
    #[must_use]
    pub const fn equiv_shift(&self) -> u32 {
        let mut shift = 0;
        if self.cpu_page_colors != 0 && self.cpu_page_colors < self.page_colors {
            shift += self.page_colors.trailing_zeros() - self.cpu_page_colors.trailing_zeros();
        }
        if self.color_equiv > 1 {
            shift += self.color_equiv.trailing_zeros();
        }
        shift
    }

    /// # Errors
    /// - [`ConfigError::PageColors`], [`ConfigError::CpuPageColors`] and
    ///   [`ConfigError::ColorEquiv`] for color counts that are not powers of two.
    /// - [`ConfigError::SizeClasses`] unless the shifts start at zero and ascend.
    /// - [`ConfigError::RetryLimit`] for a zero retry limit.
    /// - [`ConfigError::IoPoolWindow`] and [`ConfigError::IoPoolWatermarks`]
    ///   for a malformed reserve configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_colors.is_power_of_two() || self.page_colors < PAGE_COLORS_MIN {
            return Err(ConfigError::PageColors(self.page_colors));
        }
        if self.cpu_page_colors != 0 && !self.cpu_page_colors.is_power_of_two() {
            return Err(ConfigError::CpuPageColors(self.cpu_page_colors));
        }
        if self.color_equiv > 1 && !self.color_equiv.is_power_of_two() {
            return Err(ConfigError::ColorEquiv(self.color_equiv));
        }

        let shifts = self.size_classes;
        if shifts.is_empty() || shifts.len() > MAX_SIZE_CLASSES || shifts[0] != 0 {
            return Err(ConfigError::SizeClasses);
        }
        if shifts.windows(2).any(|w| w[0] >= w[1]) || shifts.iter().any(|&s| s > 30) {
            return Err(ConfigError::SizeClasses);
        }

        if self.contig_retry_limit == 0 {
            return Err(ConfigError::RetryLimit);
        }

        let pool = &self.io_pool;
        if pool.window_lo > pool.window_hi || pool.pct == 0 || pool.pct >= 100 {
            return Err(ConfigError::IoPoolWindow);
        }
        let max = pool.max.unwrap_or(usize::MAX);
        let low_water = pool.low_water.unwrap_or(pool.min);
        if pool.min > max || low_water < pool.min || low_water > max {
            return Err(ConfigError::IoPoolWatermarks {
                min: pool.min,
                low_water,
                max,
            });
        }

        Ok(())
    }
}

impl Default for PmemConfig {
    fn default() -> Self {
        Self::new()
    }
}
