//! Page descriptors and the per-node descriptor arena.

use crate::pfn::{NodeId, Pfn};
use alloc::vec::Vec;
use bitfield_struct::bitfield;

/// Arena index meaning "no page".
pub(crate) const NIL: u32 = u32::MAX;

/// Packed state of one frame.
///
/// At most one of `free`, `io_pool` and `allocated` is set. A frame with
/// none of them set is not available to the allocator (never seeded).
#[bitfield(u8)]
pub(crate) struct PageFlags {
    /// On a free list (directly or as part of a free large page).
    pub free: bool,
    /// Owned by the IO pool reserve.
    pub io_pool: bool,
    /// Handed out to a caller, or provisionally taken by a search.
    pub allocated: bool,
    /// Non-head member of a large page.
    pub constituent: bool,
    #[bits(4)]
    __: u8,
}

/// Observable state of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageState {
    Unavailable,
    Free,
    IoPool,
    Allocated,
}

impl PageFlags {
    #[inline]
    pub(crate) const fn state(self) -> PageState {
        if self.free() {
            PageState::Free
        } else if self.io_pool() {
            PageState::IoPool
        } else if self.allocated() {
            PageState::Allocated
        } else {
            PageState::Unavailable
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct PageDescriptor {
    pub pfn: Pfn,
    pub next: u32,
    pub prev: u32,
    pub color: u32,
    pub szc: u8,
    pub class: u8,
    pub flags: PageFlags,
}

/// Dense descriptor array covering one node extent.
pub(crate) struct PageArena {
    node: NodeId,
    base: Pfn,
    pages: Vec<PageDescriptor>,
}

impl PageArena {
    /// All frames start out unavailable.
    pub(crate) fn new(node: NodeId, base: Pfn, max: Pfn) -> Self {
        let n = max.offset_from(base) + 1;
        let pages = (0..n)
            .map(|i| PageDescriptor {
                pfn: base + i,
                next: NIL,
                prev: NIL,
                color: 0,
                szc: 0,
                class: 0,
                flags: PageFlags::new(),
            })
            .collect();
        Self { node, base, pages }
    }

    #[inline]
    pub(crate) const fn node(&self) -> NodeId {
        self.node
    }

    #[inline]
    pub(crate) const fn base(&self) -> Pfn {
        self.base
    }

    /// Last frame covered.
    #[inline]
    pub(crate) fn max(&self) -> Pfn {
        self.base + (self.pages.len() as u64 - 1)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn index_of(&self, pfn: Pfn) -> Option<u32> {
        if pfn < self.base || pfn > self.max() {
            return None;
        }
        u32::try_from(pfn.offset_from(self.base)).ok()
    }

    #[inline]
    pub(crate) fn pfn_of(&self, idx: u32) -> Pfn {
        self.base + u64::from(idx)
    }

    #[inline]
    pub(crate) fn get(&self, idx: u32) -> &PageDescriptor {
        &self.pages[idx as usize]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: u32) -> &mut PageDescriptor {
        &mut self.pages[idx as usize]
    }
}

/// A page handed out by [`PhysMem::alloc`](crate::PhysMem::alloc).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub pfn: Pfn,
    pub szc: u8,
}

/// Physically contiguous base pages `[start, start + len)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PageRun {
    pub start: Pfn,
    pub len: u64,
}

impl PageRun {
    #[inline]
    #[must_use]
    pub const fn new(start: Pfn, len: u64) -> Self {
        Self { start, len }
    }

    /// Last frame of the run.
    #[inline]
    #[must_use]
    pub const fn last(&self) -> Pfn {
        Pfn::new(self.start.as_u64() + self.len - 1)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.start.as_u64() && pfn.as_u64() < self.start.as_u64() + self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = Pfn> + use<> {
        let start = self.start;
        (0..self.len).map(move |i| start + i)
    }
}
