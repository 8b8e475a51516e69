//! # Free-list pool
//!
//! One [`NodeFreeLists`] per node. Free pages sit in circular, doubly linked
//! lists threaded through the descriptor arena by index, one list per
//! `(range class, size class, color)` bucket:
//!
//! ```text
//! heads[class][szc][color] ──► d7 ⇄ d3 ⇄ d12 ⇄ (back to d7)
//! counts[class][szc]        =  pages of that size class listed in the row
//! ```
//!
//! A free large page is listed once, through its head descriptor; its other
//! descriptors are marked as constituents. Every state change of a frame
//! happens here, under the owning node's lock.

use crate::color::colors_for;
use crate::error::{AuditError, PmemError, invariant_violation};
use crate::page::{NIL, PageArena, PageFlags, PageState};
use crate::pfn::{NodeId, Pfn};
use crate::range::RangeClasses;
use alloc::vec::Vec;

/// Shape of the bucket table, shared by every node.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Geometry {
    pub classes: RangeClasses,
    pub shifts: &'static [u32],
    pub page_colors: u32,
}

impl Geometry {
    #[inline]
    pub(crate) fn size_classes(&self) -> usize {
        self.shifts.len()
    }

    #[inline]
    pub(crate) fn pages_per(&self, szc: u8) -> u64 {
        1 << self.shifts[usize::from(szc)]
    }

    #[inline]
    pub(crate) fn colors(&self, szc: u8) -> u32 {
        colors_for(self.page_colors, self.shifts[usize::from(szc)])
    }

    #[inline]
    pub(crate) fn color_of(&self, pfn: Pfn, szc: u8) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let c = (pfn.as_u64() >> self.shifts[usize::from(szc)]) as u32;
        c & (self.colors(szc) - 1)
    }
}

/// A free page of size class `from` broken into free pages of size class
/// `to` on behalf of a request that may still be abandoned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Split {
    pub head: Pfn,
    pub from: u8,
    pub to: u8,
}

/// Per-node counts returned by [`NodeFreeLists::audit`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NodeTally {
    pub free: u64,
    pub io_pool: u64,
    pub allocated: u64,
}

pub(crate) struct NodeFreeLists {
    arena: PageArena,
    geo: Geometry,
    heads: Vec<u32>,
    counts: Vec<usize>,
    /// Free base pages per range class.
    free_base: Vec<usize>,
    /// Base pages ever seeded, per range class.
    managed: Vec<usize>,
}

impl NodeFreeLists {
    pub(crate) fn new(node: NodeId, base: Pfn, max: Pfn, geo: Geometry) -> Self {
        let rows = geo.classes.count() * geo.size_classes();
        Self {
            arena: PageArena::new(node, base, max),
            geo,
            heads: alloc::vec![NIL; rows * geo.page_colors as usize],
            counts: alloc::vec![0; rows],
            free_base: alloc::vec![0; geo.classes.count()],
            managed: alloc::vec![0; geo.classes.count()],
        }
    }

    #[inline]
    pub(crate) const fn node(&self) -> NodeId {
        self.arena.node()
    }

    #[inline]
    fn row(&self, class: usize, szc: u8) -> usize {
        class * self.geo.size_classes() + usize::from(szc)
    }

    #[inline]
    fn bucket(&self, class: usize, szc: u8, color: u32) -> usize {
        self.row(class, szc) * self.geo.page_colors as usize + color as usize
    }

    /// Pages of size class `szc` listed in `class`.
    #[inline]
    pub(crate) fn count(&self, class: usize, szc: u8) -> usize {
        self.counts[self.row(class, szc)]
    }

    /// Free base pages in `class`.
    #[inline]
    pub(crate) fn free_in_class(&self, class: usize) -> usize {
        self.free_base[class]
    }

    #[inline]
    pub(crate) fn managed_in_class(&self, class: usize) -> usize {
        self.managed[class]
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.free_base.iter().sum()
    }

    pub(crate) fn state_of(&self, pfn: Pfn) -> Option<PageState> {
        let idx = self.arena.index_of(pfn)?;
        Some(self.arena.get(idx).flags.state())
    }

    /// Push the head `idx` onto its bucket.
    ///
    /// The descriptor's `szc` and `class` must already be set and it must
    /// not be listed anywhere.
    fn insert(&mut self, idx: u32) {
        let d = *self.arena.get(idx);
        if d.flags.free() || d.flags.constituent() {
            invariant_violation!("frame {} inserted while listed or not a head", d.pfn);
        }

        let color = self.geo.color_of(d.pfn, d.szc);
        let class = usize::from(d.class);
        let b = self.bucket(class, d.szc, color);
        let head = self.heads[b];

        let (next, prev) = if head == NIL {
            (idx, idx)
        } else {
            let tail = self.arena.get(head).prev;
            self.arena.get_mut(tail).next = idx;
            self.arena.get_mut(head).prev = idx;
            (head, tail)
        };
        let page = self.arena.get_mut(idx);
        page.color = color;
        page.flags = PageFlags::new().with_free(true);
        page.next = next;
        page.prev = prev;
        self.heads[b] = idx;

        let row = self.row(class, d.szc);
        self.counts[row] += 1;
        self.free_base[class] += self.block_pages(d.szc);
    }

    /// Unlink the free head `idx` from its bucket. Its flags are cleared.
    fn remove_specific(&mut self, idx: u32) {
        let d = *self.arena.get(idx);
        if !d.flags.free() || d.flags.constituent() {
            invariant_violation!("frame {} removed from a free list it is not on", d.pfn);
        }

        let class = usize::from(d.class);
        let b = self.bucket(class, d.szc, d.color);
        if d.next == idx {
            self.heads[b] = NIL;
        } else {
            self.arena.get_mut(d.prev).next = d.next;
            self.arena.get_mut(d.next).prev = d.prev;
            if self.heads[b] == idx {
                self.heads[b] = d.next;
            }
        }

        let page = self.arena.get_mut(idx);
        page.next = NIL;
        page.prev = NIL;
        page.flags = PageFlags::new();

        let row = self.row(class, d.szc);
        self.counts[row] -= 1;
        self.free_base[class] -= self.block_pages(d.szc);
    }

    #[inline]
    fn block_pages(&self, szc: u8) -> usize {
        1 << self.geo.shifts[usize::from(szc)]
    }

    /// Head of the first non-empty bucket in `colors` order.
    fn select_candidate(
        &self,
        class: usize,
        szc: u8,
        colors: impl Iterator<Item = u32>,
    ) -> Option<u32> {
        if self.count(class, szc) == 0 {
            return None;
        }
        colors
            .map(|c| self.heads[self.bucket(class, szc, c)])
            .find(|&h| h != NIL)
    }

    /// Set the flags of every descriptor of the block headed by `head`.
    fn mark_block(&mut self, head: u32, szc: u8, flags: PageFlags) {
        let n = self.geo.pages_per(szc);
        for off in 0..n {
            #[allow(clippy::cast_possible_truncation)]
            let page = self.arena.get_mut(head + off as u32);
            page.szc = szc;
            page.flags = flags.with_constituent(off != 0);
        }
    }

    /// Take a page of size class `szc` from `class`, splitting a larger free
    /// page if no page of that size is free. Returns the head frame and the
    /// split, if one happened.
    pub(crate) fn alloc_in_class(
        &mut self,
        class: usize,
        szc: u8,
        colors: impl Iterator<Item = u32> + Clone,
    ) -> Option<(Pfn, Option<Split>)> {
        if let Some(idx) = self.select_candidate(class, szc, colors.clone()) {
            return Some((self.take(idx, szc), None));
        }

        #[allow(clippy::cast_possible_truncation)]
        let larger = (usize::from(szc) + 1..self.geo.size_classes()).map(|s| s as u8);
        for big in larger {
            let any = 0..self.geo.colors(big);
            if let Some(idx) = self.select_candidate(class, big, any) {
                let split = Split {
                    head: self.arena.pfn_of(idx),
                    from: big,
                    to: szc,
                };
                self.demote(idx, szc);
                let idx = self.select_candidate(class, szc, colors)?;
                return Some((self.take(idx, szc), Some(split)));
            }
        }
        None
    }

    fn take(&mut self, idx: u32, szc: u8) -> Pfn {
        self.remove_specific(idx);
        self.mark_block(idx, szc, PageFlags::new().with_allocated(true));
        self.arena.pfn_of(idx)
    }

    /// Split the free page headed by `head` into free pages of size class `to`.
    fn demote(&mut self, head: u32, to: u8) {
        let from = self.arena.get(head).szc;
        self.remove_specific(head);

        let total = self.geo.pages_per(from);
        let sub = self.geo.pages_per(to);
        let mut off = 0;
        while off < total {
            #[allow(clippy::cast_possible_truncation)]
            let sub_head = head + off as u32;
            self.mark_block(sub_head, to, PageFlags::new().with_free(true));
            self.arena.get_mut(sub_head).flags = PageFlags::new();
            self.insert(sub_head);
            off += sub;
        }
    }

    /// Detach the free base page at `idx` for exclusive use by the caller,
    /// splitting its large page if needed. The page is left allocated and
    /// the split, if any, is pushed onto `splits`.
    fn detach_base(&mut self, idx: u32, splits: &mut Vec<Split>) {
        let szc = self.arena.get(idx).szc;
        if szc != 0 {
            let pfn = self.arena.pfn_of(idx);
            let head_pfn = pfn.align_down(self.geo.pages_per(szc));
            let Some(head) = self.arena.index_of(head_pfn) else {
                invariant_violation!("large page head {head_pfn} outside of {}", self.node());
            };
            self.demote(head, 0);
            splits.push(Split {
                head: head_pfn,
                from: szc,
                to: 0,
            });
        }
        self.remove_specific(idx);
        self.arena.get_mut(idx).flags = PageFlags::new().with_allocated(true);
    }

    /// First free frame in `[from, to]` that is a multiple of `align`,
    /// detached and marked allocated.
    pub(crate) fn take_first_free(
        &mut self,
        from: Pfn,
        to: Pfn,
        align: u64,
        splits: &mut Vec<Split>,
    ) -> Option<Pfn> {
        let lo = from.max(self.arena.base()).align_up(align);
        let hi = to.min(self.arena.max());
        let mut pfn = lo;
        while pfn <= hi {
            let idx = self.arena.index_of(pfn)?;
            if self.arena.get(idx).flags.free() {
                self.detach_base(idx, splits);
                return Some(pfn);
            }
            pfn += align;
        }
        None
    }

    /// Detach `pfn` if it is free.
    pub(crate) fn take_if_free(&mut self, pfn: Pfn, splits: &mut Vec<Split>) -> bool {
        match self.arena.index_of(pfn) {
            Some(idx) if self.arena.get(idx).flags.free() => {
                self.detach_base(idx, splits);
                true
            }
            _ => false,
        }
    }

    /// Undo the splits in `splits` whose pages are all free again, turning
    /// each back into one free page of its original size class. Splits
    /// with a page still in use stay split. Returns the number merged.
    pub(crate) fn restore(&mut self, splits: impl IntoIterator<Item = Split>) -> usize {
        splits.into_iter().filter(|&s| self.merge(s)).count()
    }

    fn merge(&mut self, split: Split) -> bool {
        let Some(head) = self.arena.index_of(split.head) else {
            invariant_violation!("split page {} outside of {}", split.head, self.node());
        };
        let total = self.geo.pages_per(split.from);
        let sub = self.geo.pages_per(split.to);
        #[allow(clippy::cast_possible_truncation)]
        let sub_heads = (0..total).step_by(sub as usize).map(|off| head + off as u32);

        let intact = sub_heads.clone().all(|i| {
            let d = self.arena.get(i);
            d.flags.free() && !d.flags.constituent() && d.szc == split.to
        });
        if !intact {
            return false;
        }

        for i in sub_heads {
            self.remove_specific(i);
        }
        self.mark_block(head, split.from, PageFlags::new().with_free(true));
        self.arena.get_mut(head).flags = PageFlags::new();
        self.insert(head);
        true
    }

    /// Put back base pages detached by [`take_first_free`](Self::take_first_free)
    /// or [`take_if_free`](Self::take_if_free).
    pub(crate) fn release(&mut self, start: Pfn, len: u64) {
        for i in 0..len {
            let pfn = start + i;
            let Some(idx) = self.arena.index_of(pfn) else {
                invariant_violation!("released frame {pfn} outside of {}", self.node());
            };
            let d = self.arena.get(idx);
            if !d.flags.allocated() || d.szc != 0 {
                invariant_violation!("released frame {pfn} was not provisionally taken");
            }
            self.arena.get_mut(idx).flags = PageFlags::new();
            self.insert(idx);
        }
    }

    /// Give back a run that will not be used after all, along with the
    /// large pages taking it split. Returns the number of pages merged.
    pub(crate) fn abandon(&mut self, start: Pfn, len: u64, splits: &mut Vec<Split>) -> usize {
        self.release(start, len);
        self.restore(splits.drain(..))
    }

    /// Return an allocated page of size class `szc` to the free lists.
    pub(crate) fn free_page(&mut self, pfn: Pfn, szc: u8) -> Result<(), PmemError> {
        let idx = self.arena.index_of(pfn).ok_or(PmemError::UnknownFrame(pfn))?;
        let d = self.arena.get(idx);
        if !d.flags.allocated() || d.flags.constituent() || d.szc != szc {
            return Err(PmemError::NotAllocated(pfn));
        }
        self.mark_block(idx, szc, PageFlags::new().with_free(true));
        self.arena.get_mut(idx).flags = PageFlags::new();
        self.insert(idx);
        Ok(())
    }

    /// Hand a provisionally taken base page over to the IO pool reserve.
    pub(crate) fn mark_reserved(&mut self, pfn: Pfn) {
        match self.arena.index_of(pfn) {
            Some(idx) if self.arena.get(idx).flags.allocated() => {
                self.arena.get_mut(idx).flags = PageFlags::new().with_io_pool(true);
            }
            _ => invariant_violation!("frame {pfn} reserved without being taken first"),
        }
    }

    /// A reserve frame handed to a caller.
    pub(crate) fn claim_reserved(&mut self, pfn: Pfn) {
        match self.arena.index_of(pfn) {
            Some(idx) if self.arena.get(idx).flags.io_pool() => {
                self.arena.get_mut(idx).flags = PageFlags::new().with_allocated(true);
            }
            _ => invariant_violation!("frame {pfn} claimed from the reserve but not in it"),
        }
    }

    /// A reserve frame given back to the free lists.
    pub(crate) fn unreserve(&mut self, pfn: Pfn) {
        match self.arena.index_of(pfn) {
            Some(idx) if self.arena.get(idx).flags.io_pool() => {
                self.arena.get_mut(idx).flags = PageFlags::new();
                self.insert(idx);
            }
            _ => invariant_violation!("frame {pfn} left the reserve but was not in it"),
        }
    }

    /// Make the unavailable frames of `[lo, hi]` allocatable, carving them
    /// into the largest naturally aligned pages that fit. Returns the number
    /// of base pages added.
    pub(crate) fn seed(&mut self, lo: Pfn, hi: Pfn) -> u64 {
        let lo = lo.max(self.arena.base());
        let hi = hi.min(self.arena.max());
        let mut seeded = 0;
        let mut pfn = lo;

        while pfn <= hi {
            let Some(idx) = self.arena.index_of(pfn) else {
                break;
            };
            if self.arena.get(idx).flags.state() != PageState::Unavailable {
                pfn += 1;
                continue;
            }

            let class = self.geo.classes.class_of(pfn);
            let szc = self.largest_fit(pfn, hi, class);
            let n = self.geo.pages_per(szc);

            #[allow(clippy::cast_possible_truncation)]
            for off in 0..n {
                self.arena.get_mut(idx + off as u32).class = class as u8;
            }
            self.mark_block(idx, szc, PageFlags::new().with_free(true));
            self.arena.get_mut(idx).flags = PageFlags::new();
            self.insert(idx);
            self.managed[class] += self.block_pages(szc);

            seeded += n;
            pfn += n;
        }
        seeded
    }

    fn largest_fit(&self, pfn: Pfn, hi: Pfn, class: usize) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        let larger = (1..self.geo.size_classes()).rev().map(|s| s as u8);
        for szc in larger {
            let n = self.geo.pages_per(szc);
            let last = pfn + (n - 1);
            if !pfn.is_aligned(n) || last > hi || self.geo.classes.class_of(last) != class {
                continue;
            }
            let all_unavailable = (0..n).all(|off| {
                self.state_of(pfn + off) == Some(PageState::Unavailable)
            });
            if all_unavailable {
                return szc;
            }
        }
        0
    }

    /// Walk every bucket and every descriptor and cross-check them.
    pub(crate) fn audit(&self) -> Result<NodeTally, AuditError> {
        let node = self.node();
        let mut listed = alloc::vec![false; self.arena.len()];

        for class in 0..self.geo.classes.count() {
            #[allow(clippy::cast_possible_truncation)]
            for szc in (0..self.geo.size_classes()).map(|s| s as u8) {
                let mut in_row = 0;
                for color in 0..self.geo.colors(szc) {
                    in_row += self.audit_bucket(class, szc, color, &mut listed)?;
                }
                let counted = self.count(class, szc);
                if counted != in_row {
                    return Err(AuditError::CounterMismatch {
                        node,
                        class,
                        szc,
                        counted,
                        listed: in_row,
                    });
                }
            }
        }

        let mut tally = NodeTally::default();
        #[allow(clippy::cast_possible_truncation)]
        for idx in 0..self.arena.len() as u32 {
            let d = self.arena.get(idx);
            let f = d.flags;
            let set = u8::from(f.free()) + u8::from(f.io_pool()) + u8::from(f.allocated());
            if set > 1 {
                return Err(AuditError::StateMismatch { pfn: d.pfn });
            }
            match f.state() {
                PageState::Free if !listed[idx as usize] => return Err(AuditError::Orphan(d.pfn)),
                PageState::Free => tally.free += 1,
                PageState::IoPool => tally.io_pool += 1,
                PageState::Allocated => tally.allocated += 1,
                PageState::Unavailable => {}
            }
        }
        Ok(tally)
    }

    fn audit_bucket(
        &self,
        class: usize,
        szc: u8,
        color: u32,
        listed: &mut [bool],
    ) -> Result<usize, AuditError> {
        let head = self.heads[self.bucket(class, szc, color)];
        if head == NIL {
            return Ok(0);
        }

        let mut len = 0;
        let mut cur = head;
        loop {
            let d = self.arena.get(cur);
            if self.arena.get(d.next).prev != cur || len > self.arena.len() {
                return Err(AuditError::BrokenLink(d.pfn));
            }
            if !d.flags.free() || d.flags.constituent() {
                return Err(AuditError::StateMismatch { pfn: d.pfn });
            }
            if usize::from(d.class) != class
                || d.szc != szc
                || d.color != color
                || self.geo.classes.class_of(d.pfn) != class
            {
                return Err(AuditError::WrongBucket { pfn: d.pfn });
            }

            for off in 0..self.geo.pages_per(szc) {
                #[allow(clippy::cast_possible_truncation)]
                let i = cur + off as u32;
                let page = self.arena.get(i);
                if listed[i as usize] {
                    return Err(AuditError::Duplicate(page.pfn));
                }
                if off != 0 && !(page.flags.free() && page.flags.constituent() && page.szc == szc) {
                    return Err(AuditError::StateMismatch { pfn: page.pfn });
                }
                listed[i as usize] = true;
            }

            len += 1;
            cur = d.next;
            if cur == head {
                return Ok(len);
            }
        }
    }
}
