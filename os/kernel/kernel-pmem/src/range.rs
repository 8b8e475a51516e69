//! # Range table
//!
//! Physical memory of every node is cut along hardware-significant address
//! boundaries (the *range classes*) into disjoint range descriptors:
//!
//! ```text
//!  class 0   >= 4 GiB        ┌─node0─┐ ┌─node1────────┐
//!  class 1   2 GiB .. 4 GiB  ├─node0─┤
//!  class 2   16 MiB .. 2 GiB ├─node0─┤
//!  class 3   < 16 MiB        └─node0─┘
//! ```
//!
//! Descriptors are emitted class by class from the highest downward, and
//! within a class in configured node order. Each node's descriptors are
//! chained through `next`, so a node walk goes from high to low addresses.
//! The table only grows (node hot-add).

use crate::config::NodeConfig;
use crate::error::RangeTableError;
use crate::pfn::{NodeId, PFN_2G, PFN_4G, PFN_16M, Pfn};
use alloc::vec::Vec;

/// Low bounds of the address-range classes, strictly descending, ending at 0.
///
/// Class `i` spans `[bounds[i], bounds[i - 1] - 1]`; class 0 is unbounded
/// above.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RangeClasses(&'static [u64]);

static X86_BOUNDS: [u64; 4] = [PFN_4G, PFN_2G, PFN_16M, 0];

impl RangeClasses {
    #[must_use]
    pub const fn new(bounds: &'static [u64]) -> Self {
        Self(bounds)
    }

    /// `>= 4 GiB`, `2 GiB..4 GiB`, `16 MiB..2 GiB`, `< 16 MiB`.
    #[must_use]
    pub const fn x86() -> Self {
        Self(&X86_BOUNDS)
    }

    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.0.len()
    }

    /// Index of the lowest class, the one starting at frame 0.
    #[inline]
    #[must_use]
    pub const fn lowest(&self) -> usize {
        self.0.len() - 1
    }

    #[inline]
    #[must_use]
    pub const fn lo(&self, class: usize) -> Pfn {
        Pfn::new(self.0[class])
    }

    /// Inclusive upper bound of `class`.
    #[inline]
    #[must_use]
    pub const fn hi(&self, class: usize) -> Pfn {
        if class == 0 {
            Pfn::new(u64::MAX)
        } else {
            Pfn::new(self.0[class - 1] - 1)
        }
    }

    #[must_use]
    pub fn class_of(&self, pfn: Pfn) -> usize {
        self.0
            .iter()
            .position(|&lo| pfn.as_u64() >= lo)
            .unwrap_or(self.lowest())
    }

    /// # Errors
    /// [`RangeTableError::BadClasses`] unless the bounds strictly descend
    /// and end at frame 0.
    pub fn validate(&self) -> Result<(), RangeTableError> {
        let ok = !self.0.is_empty()
            && self.0[self.0.len() - 1] == 0
            && self.0.windows(2).all(|w| w[0] > w[1]);
        if ok { Ok(()) } else { Err(RangeTableError::BadClasses) }
    }
}

impl Default for RangeClasses {
    fn default() -> Self {
        Self::x86()
    }
}

/// One node's memory inside one range class, `[lo, hi]` inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RangeDescriptor {
    pub node: NodeId,
    pub lo: Pfn,
    pub hi: Pfn,
    pub class: usize,
    /// Next lower range of the same node.
    pub next: Option<usize>,
    pub exists: bool,
}

impl RangeDescriptor {
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.hi.as_u64() - self.lo.as_u64() + 1
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.lo.as_u64() && pfn.as_u64() <= self.hi.as_u64()
    }
}

#[derive(Debug, Clone)]
pub struct RangeTable {
    classes: RangeClasses,
    nodes: Vec<NodeConfig>,
    ranges: Vec<RangeDescriptor>,
    /// First (highest) range of each node, parallel to `nodes`.
    heads: Vec<Option<usize>>,
}

/// Partition `nodes` along `classes`.
///
/// ### Examples
/// ```rust
/// # use kernel_pmem::*;
/// let table = build_ranges(
///     &[NodeConfig::new(0, 0, 0x17_FFFF), NodeConfig::new(1, 0x18_0000, 0x1F_FFFF)],
///     RangeClasses::x86(),
/// )
/// .unwrap();
///
/// // node0 spans all four classes, node1 only the top one.
/// assert_eq!(table.len(), 5);
/// assert_eq!(table.node_ranges(NodeId(0)).count(), 4);
/// assert_eq!(table.find(Pfn::new(0x800)).map(|r| r.class), Some(3));
/// ```
///
/// # Errors
/// - [`RangeTableError::BadClasses`] for malformed class bounds.
/// - [`RangeTableError::NoNodes`] for an empty node list.
/// - Empty, overlapping or duplicate node extents.
pub fn build_ranges(
    nodes: &[NodeConfig],
    classes: RangeClasses,
) -> Result<RangeTable, RangeTableError> {
    classes.validate()?;
    if nodes.is_empty() {
        return Err(RangeTableError::NoNodes);
    }

    let mut accepted: Vec<NodeConfig> = Vec::with_capacity(nodes.len());
    for cfg in nodes {
        check_node(&accepted, cfg)?;
        accepted.push(*cfg);
    }

    let mut table = RangeTable {
        classes,
        nodes: accepted,
        ranges: Vec::new(),
        heads: alloc::vec![None; nodes.len()],
    };
    let mut tails: Vec<Option<usize>> = alloc::vec![None; nodes.len()];

    for class in 0..classes.count() {
        for slot in 0..table.nodes.len() {
            table.emit(slot, class, &mut tails);
        }
    }

    Ok(table)
}

fn check_node(existing: &[NodeConfig], cfg: &NodeConfig) -> Result<(), RangeTableError> {
    if cfg.base > cfg.max {
        return Err(RangeTableError::EmptyExtent(cfg.node));
    }
    if cfg.pages() >= u64::from(u32::MAX) {
        return Err(RangeTableError::ExtentTooLarge(cfg.node));
    }
    for other in existing {
        if other.node == cfg.node {
            return Err(RangeTableError::DuplicateNode(cfg.node));
        }
        if other.base <= cfg.max && cfg.base <= other.max {
            return Err(RangeTableError::Overlap {
                a: other.node,
                b: cfg.node,
            });
        }
    }
    Ok(())
}

impl RangeTable {
    /// Append the descriptor for node `slot` in `class`, if they intersect.
    fn emit(&mut self, slot: usize, class: usize, tails: &mut [Option<usize>]) {
        let cfg = self.nodes[slot];
        let lo = cfg.base.max(self.classes.lo(class));
        let hi = cfg.max.min(self.classes.hi(class));
        if lo > hi {
            return;
        }

        let idx = self.ranges.len();
        self.ranges.push(RangeDescriptor {
            node: cfg.node,
            lo,
            hi,
            class,
            next: None,
            exists: true,
        });
        match tails[slot] {
            Some(tail) => self.ranges[tail].next = Some(idx),
            None => self.heads[slot] = Some(idx),
        }
        tails[slot] = Some(idx);
    }

    /// Add a hot-plugged node. Existing descriptors are left untouched.
    ///
    /// # Errors
    /// An empty extent, an overlap with a known node, or a node ID already in
    /// use. The table is unchanged then.
    pub fn append_node(&mut self, cfg: NodeConfig) -> Result<(), RangeTableError> {
        check_node(&self.nodes, &cfg)?;
        self.nodes.push(cfg);
        self.heads.push(None);

        let slot = self.nodes.len() - 1;
        let mut tails: Vec<Option<usize>> = alloc::vec![None; self.nodes.len()];
        for class in 0..self.classes.count() {
            self.emit(slot, class, &mut tails);
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn classes(&self) -> RangeClasses {
        self.classes
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&RangeDescriptor> {
        self.ranges.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangeDescriptor> {
        self.ranges.iter()
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, node: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node == node)
    }

    /// The node's ranges from the highest class downward.
    pub fn node_ranges(&self, node: NodeId) -> impl Iterator<Item = &RangeDescriptor> {
        let head = self
            .nodes
            .iter()
            .position(|n| n.node == node)
            .and_then(|slot| self.heads[slot]);
        core::iter::successors(head.map(|i| &self.ranges[i]), |r| {
            r.next.map(|i| &self.ranges[i])
        })
    }

    #[must_use]
    pub fn find(&self, pfn: Pfn) -> Option<&RangeDescriptor> {
        self.ranges.iter().find(|r| r.exists && r.contains(pfn))
    }

    /// Ranges intersecting `[lo, hi]`, clipped to the window, in table order.
    #[must_use]
    pub fn intersecting(&self, lo: Pfn, hi: Pfn) -> Vec<RangeCandidate> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.exists && r.lo <= hi && lo <= r.hi)
            .map(|(index, r)| RangeCandidate {
                index,
                node: r.node,
                class: r.class,
                lo: r.lo.max(lo),
                hi: r.hi.min(hi),
            })
            .collect()
    }
}

/// A range descriptor clipped to a request window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RangeCandidate {
    /// Position of the descriptor in the table.
    pub index: usize,
    pub node: NodeId,
    pub class: usize,
    pub lo: Pfn,
    pub hi: Pfn,
}

impl RangeCandidate {
    #[inline]
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.hi.as_u64() - self.lo.as_u64() + 1
    }
}

/// Search order of the ranges a contiguous request may be carved from.
pub trait RangeOrdering: Send + Sync {
    /// Reorder `candidates`, given in table order, into search order.
    fn order(&self, candidates: &mut [RangeCandidate]);
}

/// Most restrictive first: smallest clipped span, then higher class, then
/// node order.
#[derive(Debug, Default, Copy, Clone)]
pub struct SmallestSpanFirst;

impl RangeOrdering for SmallestSpanFirst {
    fn order(&self, candidates: &mut [RangeCandidate]) {
        candidates.sort_by_key(|c| (c.span(), c.class, c.index));
    }
}

/// Table order: highest class first, then node order.
#[derive(Debug, Default, Copy, Clone)]
pub struct HighestFirst;

impl RangeOrdering for HighestFirst {
    fn order(&self, candidates: &mut [RangeCandidate]) {
        candidates.sort_by_key(|c| (c.class, c.index));
    }
}
