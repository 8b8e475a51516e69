//! # Page coloring
//!
//! A page's *color* is the cache-associativity class its physical address
//! maps to. Handing consecutive requests pages of different colors keeps
//! them from evicting each other in physically indexed caches.
//!
//! For size class `szc` with page shift `s`:
//!
//! ```text
//! colors(szc) = max(1, page_colors >> s)
//! color(pfn)  = (pfn >> s) & (colors(szc) - 1)
//! ```
//!
//! Colors that differ only in their high `equiv_shift` bits are
//! *equivalent*: the CPU cannot tell them apart (reduced color set) or the
//! administrator said so (`color_equiv`). When the preferred bucket is empty
//! the selector tries the equivalent colors before any other.

use crate::config::PmemConfig;
use crate::pfn::Pfn;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Number of colors of a size class with page shift `shift`.
#[inline]
#[must_use]
pub(crate) const fn colors_for(page_colors: u32, shift: u32) -> u32 {
    let n = page_colors >> shift;
    if n == 0 { 1 } else { n }
}

/// Order in which the color buckets of one size class are visited.
pub trait ColorEquivalence: Send + Sync {
    /// The `i`-th color to visit, for `i` in `0..ncolors`, starting at
    /// `start`. Must visit every color exactly once.
    ///
    /// `equiv_shift` is already clamped to `log2(ncolors)`.
    fn color_at(&self, start: u32, ncolors: u32, equiv_shift: u32, i: u32) -> u32;
}

/// Preferred color, then its equivalents (same low bits), then the next
/// equivalence group.
///
/// With 16 colors and a shift of 2 the order from color 1 is
/// `1 5 9 13 2 6 10 14 3 7 ...`.
#[derive(Debug, Default, Copy, Clone)]
pub struct StrideEquivalence;

impl ColorEquivalence for StrideEquivalence {
    fn color_at(&self, start: u32, ncolors: u32, equiv_shift: u32, i: u32) -> u32 {
        let group = 1 << equiv_shift;
        let stride = ncolors >> equiv_shift;
        let (j, k) = (i / group, i % group);
        (start + j + k * stride) & (ncolors - 1)
    }
}

/// Plain sequential walk from the preferred color.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoEquivalence;

impl ColorEquivalence for NoEquivalence {
    fn color_at(&self, start: u32, ncolors: u32, _equiv_shift: u32, i: u32) -> u32 {
        (start + i) & (ncolors - 1)
    }
}

/// Picks starting colors and visiting orders for every size class.
pub struct ColorSelector<E = StrideEquivalence> {
    page_colors: u32,
    shifts: &'static [u32],
    equiv_shift: u32,
    cursors: Vec<AtomicU32>,
    strategy: E,
}

impl<E: ColorEquivalence> ColorSelector<E> {
    #[must_use]
    pub fn new(config: &PmemConfig, strategy: E) -> Self {
        Self {
            page_colors: config.page_colors,
            shifts: config.size_classes,
            equiv_shift: config.equiv_shift(),
            cursors: config.size_classes.iter().map(|_| AtomicU32::new(0)).collect(),
            strategy,
        }
    }

    #[inline]
    #[must_use]
    pub fn size_classes(&self) -> usize {
        self.shifts.len()
    }

    /// Colors of size class `szc`.
    #[inline]
    #[must_use]
    pub fn colors(&self, szc: u8) -> u32 {
        colors_for(self.page_colors, self.shifts[usize::from(szc)])
    }

    /// Pages of size class `szc`, in base pages.
    #[inline]
    #[must_use]
    pub fn pages_per(&self, szc: u8) -> u64 {
        1 << self.shifts[usize::from(szc)]
    }

    #[inline]
    #[must_use]
    pub fn color_of(&self, pfn: Pfn, szc: u8) -> u32 {
        let shift = self.shifts[usize::from(szc)];
        // Only the low bits survive the mask.
        #[allow(clippy::cast_possible_truncation)]
        let c = (pfn.as_u64() >> shift) as u32;
        c & (self.colors(szc) - 1)
    }

    /// Starting color: the preferred one, or the next round-robin color.
    #[must_use]
    pub fn start_color(&self, szc: u8, preferred: Option<u32>) -> u32 {
        let n = self.colors(szc);
        preferred.unwrap_or_else(|| self.cursors[usize::from(szc)].fetch_add(1, Ordering::Relaxed))
            & (n - 1)
    }

    /// Every color of `szc`, beginning with `start`.
    #[must_use]
    pub fn order(&self, szc: u8, start: u32) -> ColorOrder<'_, E> {
        let ncolors = self.colors(szc);
        ColorOrder {
            strategy: &self.strategy,
            start: start & (ncolors - 1),
            ncolors,
            equiv_shift: self.equiv_shift.min(ncolors.trailing_zeros()),
            i: 0,
        }
    }
}

/// Iterator over the buckets of one size class in visiting order.
pub struct ColorOrder<'a, E> {
    strategy: &'a E,
    start: u32,
    ncolors: u32,
    equiv_shift: u32,
    i: u32,
}

impl<E> Clone for ColorOrder<'_, E> {
    fn clone(&self) -> Self {
        Self { ..*self }
    }
}

impl<E: ColorEquivalence> Iterator for ColorOrder<'_, E> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.i >= self.ncolors {
            return None;
        }
        let c = self
            .strategy
            .color_at(self.start, self.ncolors, self.equiv_shift, self.i);
        self.i += 1;
        Some(c)
    }
}
