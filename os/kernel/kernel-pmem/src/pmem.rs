use crate::color::{ColorEquivalence, ColorSelector, StrideEquivalence};
use crate::config::{NodeConfig, PmemConfig};
use crate::error::{AuditError, PmemError, PmemInitError, RangeTableError, invariant_violation};
use crate::freelist::{Geometry, NodeFreeLists, Split};
use crate::io_pool::{IoPoolReserve, IoPoolTunables};
use crate::page::{PageRef, PageRun, PageState};
use crate::pfn::{NodeId, PFN_4G, Pfn};
use crate::range::{RangeOrdering, RangeTable, SmallestSpanFirst, build_ranges};
use crate::stats::{PmemStats, PmemStatsSnapshot};
use crate::vm::{NoReclaim, PageFreer, VmLayer};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{RwSpin, SpinMutex, TicketMutex};
use log::{debug, info};

/// Free lists of one node behind that node's lock.
pub(crate) struct NodePool {
    pub node: NodeId,
    pub base: Pfn,
    pub max: Pfn,
    pub lists: TicketMutex<NodeFreeLists>,
}

impl NodePool {
    fn new(cfg: &NodeConfig, geo: Geometry) -> Self {
        Self {
            node: cfg.node,
            base: cfg.base,
            max: cfg.max,
            lists: TicketMutex::new(NodeFreeLists::new(cfg.node, cfg.base, cfg.max, geo)),
        }
    }
}

/// Everything hot-add replaces at once.
pub(crate) struct Topology {
    pub ranges: RangeTable,
    pub pools: Vec<Arc<NodePool>>,
}

impl Topology {
    pub(crate) fn pool(&self, node: NodeId) -> Option<&Arc<NodePool>> {
        self.pools.iter().find(|p| p.node == node)
    }

    pub(crate) fn pool_for(&self, pfn: Pfn) -> Option<&Arc<NodePool>> {
        self.pools.iter().find(|p| pfn >= p.base && pfn <= p.max)
    }
}

/// Totals found by [`PhysMem::check_invariants`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub free_pages: u64,
    pub io_pool_pages: u64,
    pub allocated_pages: u64,
}

/// The physical page allocator.
///
/// Owns the range table, one free-list pool per node, the IO pool reserve
/// and the counters. Every method takes `&self`; share it by reference or
/// behind an [`Arc`].
///
/// Lock domains, never nested:
///
/// * `topology`: read-mostly, replaced as a whole on hot-add. Readers clone
///   the [`Arc`] and let go of the lock right away.
/// * one ticket lock per node, guarding its descriptors and buckets.
/// * `reserve`: the IO pool array.
pub struct PhysMem<
    V: VmLayer = NoReclaim,
    O: RangeOrdering = SmallestSpanFirst,
    E: ColorEquivalence = StrideEquivalence,
> {
    pub(crate) config: PmemConfig,
    geo: Geometry,
    topology: RwSpin<Arc<Topology>>,
    pub(crate) reserve: SpinMutex<IoPoolReserve>,
    /// Base pages ever seeded.
    managed: AtomicU64,
    colors: ColorSelector<E>,
    pub(crate) stats: PmemStats,
    pub(crate) ordering: O,
    pub(crate) vm: V,
}

impl<V: VmLayer> PhysMem<V> {
    /// Allocator with the default range ordering and color equivalence.
    /// All frames start out unavailable; hand usable memory over with
    /// [`seed_free`](Self::seed_free).
    ///
    /// # Errors
    /// An invalid configuration or node layout.
    pub fn new(config: PmemConfig, nodes: &[NodeConfig], vm: V) -> Result<Self, PmemInitError> {
        Self::with_strategies(config, nodes, vm, SmallestSpanFirst, StrideEquivalence)
    }
}

impl<V: VmLayer, O: RangeOrdering, E: ColorEquivalence> PhysMem<V, O, E> {
    /// Allocator with explicit range ordering and color equivalence.
    ///
    /// # Errors
    /// - [`PmemInitError::Config`] if `config` does not validate.
    /// - [`PmemInitError::Ranges`] if the nodes do not form a range table.
    pub fn with_strategies(
        config: PmemConfig,
        nodes: &[NodeConfig],
        vm: V,
        ordering: O,
        equivalence: E,
    ) -> Result<Self, PmemInitError> {
        config.validate()?;
        let ranges = build_ranges(nodes, config.range_classes)?;

        let geo = Geometry {
            classes: config.range_classes,
            shifts: config.size_classes,
            page_colors: config.page_colors,
        };
        let pools = ranges
            .nodes()
            .iter()
            .map(|n| Arc::new(NodePool::new(n, geo)))
            .collect();

        info!(
            "pmem: {} nodes in {} ranges, {} colors, equivalence shift {}, size class shifts {:?}",
            nodes.len(),
            ranges.len(),
            config.page_colors,
            config.equiv_shift(),
            config.size_classes
        );
        for r in ranges.iter() {
            debug!(
                "pmem: range {}..={} on {} class {}",
                r.lo, r.hi, r.node, r.class
            );
        }

        Ok(Self {
            config,
            geo,
            topology: RwSpin::new(Arc::new(Topology { ranges, pools })),
            reserve: SpinMutex::new(IoPoolReserve::new(IoPoolTunables::derive(
                &config.io_pool,
                0,
            ))),
            managed: AtomicU64::new(0),
            colors: ColorSelector::new(&config, equivalence),
            stats: PmemStats::new(config.range_classes.count()),
            ordering,
            vm,
        })
    }

    pub(crate) fn topology(&self) -> Arc<Topology> {
        Arc::clone(&self.topology.read())
    }

    #[must_use]
    pub const fn config(&self) -> &PmemConfig {
        &self.config
    }

    #[must_use]
    pub const fn vm(&self) -> &V {
        &self.vm
    }

    #[must_use]
    pub const fn colors(&self) -> &ColorSelector<E> {
        &self.colors
    }

    /// A copy of the current range table.
    #[must_use]
    pub fn ranges(&self) -> RangeTable {
        self.topology().ranges.clone()
    }

    /// Make the frames of `[start, end)` allocatable. Frames outside every
    /// node, and frames already handed over, are skipped. Returns the number
    /// of pages added.
    pub fn seed_free(&self, start: Pfn, end: Pfn) -> u64 {
        if end <= start {
            return 0;
        }
        let last = end - 1;
        let topo = self.topology();

        let mut seeded = 0;
        for pool in &topo.pools {
            if pool.max < start || pool.base > last {
                continue;
            }
            seeded += pool.lists.lock().seed(start.max(pool.base), last.min(pool.max));
        }

        let managed = self.managed.fetch_add(seeded, Ordering::Relaxed) + seeded;
        self.reserve.lock().rederive(&self.config.io_pool, managed);
        info!("pmem: seeded {seeded} pages from {start}..{end}, {managed} managed");
        seeded
    }

    /// Hot-add a node. Its frames stay unavailable until seeded.
    ///
    /// # Errors
    /// Same as [`RangeTable::append_node`]; the topology is unchanged then.
    pub fn add_node(&self, cfg: NodeConfig) -> Result<(), RangeTableError> {
        let pool = Arc::new(NodePool::new(&cfg, self.geo));

        let mut topo = self.topology.write();
        let mut ranges = topo.ranges.clone();
        ranges.append_node(cfg)?;
        let mut pools = topo.pools.clone();
        pools.push(pool);
        *topo = Arc::new(Topology { ranges, pools });
        drop(topo);

        info!("pmem: hot-added {} at {}..={}", cfg.node, cfg.base, cfg.max);
        Ok(())
    }

    /// Allocate `npages` pages of size class `szc`, preferring `node_hint`.
    ///
    /// Colors rotate from one page to the next. The pages need not be
    /// contiguous.
    ///
    /// # Errors
    /// - [`PmemError::InvalidSizeClass`] and [`PmemError::UnknownNode`] for
    ///   bad arguments.
    /// - [`PmemError::InsufficientMemory`] right away if the request is
    ///   larger than all memory ever seeded, or after every retry for a
    ///   caller that may block.
    /// - [`PmemError::WouldBlock`] if the pages are not there now and the
    ///   caller may not block. Nothing stays allocated on failure.
    pub fn alloc(
        &self,
        npages: usize,
        szc: u8,
        node_hint: Option<NodeId>,
        may_block: bool,
    ) -> Result<Vec<PageRef>, PmemError> {
        self.alloc_pages(npages, szc, node_hint, None, may_block)
    }

    /// Like [`alloc`](Self::alloc), but every page is searched for starting
    /// at `color`.
    ///
    /// # Errors
    /// [`PmemError::InvalidColor`] if `szc` has no such color, otherwise as
    /// [`alloc`](Self::alloc).
    pub fn alloc_colored(
        &self,
        npages: usize,
        szc: u8,
        node_hint: Option<NodeId>,
        color: u32,
        may_block: bool,
    ) -> Result<Vec<PageRef>, PmemError> {
        self.check_szc(szc)?;
        if color >= self.colors.colors(szc) {
            return Err(PmemError::InvalidColor { color, szc });
        }
        self.alloc_pages(npages, szc, node_hint, Some(color), may_block)
    }

    fn check_szc(&self, szc: u8) -> Result<(), PmemError> {
        if usize::from(szc) < self.geo.size_classes() {
            Ok(())
        } else {
            Err(PmemError::InvalidSizeClass(szc))
        }
    }

    fn alloc_pages(
        &self,
        npages: usize,
        szc: u8,
        node_hint: Option<NodeId>,
        color: Option<u32>,
        may_block: bool,
    ) -> Result<Vec<PageRef>, PmemError> {
        self.check_szc(szc)?;
        let topo = self.topology();
        let order = Self::node_order(&topo, node_hint)?;

        // More than was ever seeded can never be satisfied.
        let pages_per = self.geo.pages_per(szc);
        let managed = self.managed.load(Ordering::Relaxed);
        let wanted = u64::try_from(npages)
            .ok()
            .and_then(|n| n.checked_mul(pages_per));
        if !wanted.is_some_and(|total| total <= managed) {
            return Err(PmemError::InsufficientMemory);
        }

        let limit = self.config.contig_retry_limit;
        for _ in 0..limit {
            let mut pages = Vec::with_capacity(npages);
            let mut splits = Vec::new();
            while pages.len() < npages {
                let start = self.colors.start_color(szc, color);
                match self.alloc_one(&order, szc, start) {
                    Some((pfn, split)) => {
                        pages.push(PageRef { pfn, szc });
                        splits.extend(split);
                    }
                    None => break,
                }
            }
            if pages.len() == npages {
                return Ok(pages);
            }

            let missing = npages - pages.len();
            self.free(&pages)?;
            self.restore_splits(&topo, splits);
            if !may_block {
                return Err(PmemError::WouldBlock);
            }
            self.reclaim(missing as u64 * pages_per);
        }
        Err(PmemError::InsufficientMemory)
    }

    /// Hinted node first, then the others in configuration order.
    fn node_order(
        topo: &Topology,
        node_hint: Option<NodeId>,
    ) -> Result<Vec<Arc<NodePool>>, PmemError> {
        let mut order = Vec::with_capacity(topo.pools.len());
        if let Some(node) = node_hint {
            let pool = topo.pool(node).ok_or(PmemError::UnknownNode(node))?;
            order.push(Arc::clone(pool));
        }
        order.extend(
            topo.pools
                .iter()
                .filter(|p| Some(p.node) != node_hint)
                .cloned(),
        );
        Ok(order)
    }

    /// One page, walking each node's classes from the highest down. Classes
    /// a node [holds back](Self::held_back) are only tried once nothing
    /// else is free on any node.
    fn alloc_one(
        &self,
        order: &[Arc<NodePool>],
        szc: u8,
        start: u32,
    ) -> Option<(Pfn, Option<Split>)> {
        let colors = self.colors.order(szc, start);
        let nclasses = self.geo.classes.count();

        for relaxed in [false, true] {
            for pool in order {
                let mut lists = pool.lists.lock();
                for class in 0..nclasses {
                    let usable =
                        self.held_back(&lists, class) == relaxed && lists.free_in_class(class) > 0;
                    if !usable {
                        continue;
                    }
                    match lists.alloc_in_class(class, szc, colors.clone()) {
                        Some((pfn, split)) => {
                            drop(lists);
                            self.stats.hits(class, self.geo.pages_per(szc));
                            if split.is_some() {
                                PmemStats::bump(&self.stats.splits);
                            }
                            return Some((pfn, split));
                        }
                        None => self.stats.miss(class),
                    }
                }
            }
        }
        None
    }

    /// Whether ordinary allocations leave `class` of this node alone for
    /// now. The lowest class is held back while it has `desfree_low` free
    /// pages or fewer. Classes below 4 GiB are held back while the node's
    /// free memory there is at or below [`PmemConfig::desfree_4g`], as long
    /// as the node also has memory above 4 GiB.
    fn held_back(&self, lists: &NodeFreeLists, class: usize) -> bool {
        let classes = self.geo.classes;
        if classes.count() > 1
            && class == classes.lowest()
            && lists.free_in_class(class) <= self.config.desfree_low
        {
            return true;
        }

        let below_4g = |c: usize| classes.hi(c) < Pfn::new(PFN_4G);
        if !below_4g(class) {
            return false;
        }
        let (mut managed, mut free, mut above) = (0, 0, false);
        for c in 0..classes.count() {
            if below_4g(c) {
                managed += lists.managed_in_class(c);
                free += lists.free_in_class(c);
            } else {
                above |= lists.managed_in_class(c) > 0;
            }
        }
        above && free <= self.config.desfree_4g(managed)
    }

    /// Merge the large pages in `splits` back together where every page
    /// of one is free again.
    pub(crate) fn restore_splits(&self, topo: &Topology, splits: Vec<Split>) {
        let mut merged = 0;
        for split in splits {
            let Some(pool) = topo.pool_for(split.head) else {
                invariant_violation!("split page {} belongs to no node", split.head);
            };
            merged += pool.lists.lock().restore([split]);
        }
        if merged > 0 {
            PmemStats::add(&self.stats.merges, merged as u64);
            debug!("pmem: merged {merged} split pages again");
        }
    }

    /// Return pages from [`alloc`](Self::alloc). Stops at the first page
    /// that is not currently allocated; the pages before it are freed.
    ///
    /// # Errors
    /// - [`PmemError::UnknownFrame`] for a frame outside every node.
    /// - [`PmemError::NotAllocated`] for a page that is not allocated, a
    ///   constituent of a large page, or given with the wrong size class.
    pub fn free(&self, pages: &[PageRef]) -> Result<(), PmemError> {
        if pages.is_empty() {
            return Ok(());
        }
        let topo = self.topology();
        for page in pages {
            let pool = topo
                .pool_for(page.pfn)
                .ok_or(PmemError::UnknownFrame(page.pfn))?;
            pool.lists.lock().free_page(page.pfn, page.szc)?;
        }
        Ok(())
    }

    /// Return a run from [`alloc_contig`](Self::alloc_contig).
    ///
    /// # Errors
    /// As [`free`](Self::free), for the first bad frame of the run.
    pub fn free_run(&self, run: PageRun) -> Result<(), PmemError> {
        let topo = self.topology();
        let mut pfn = run.start;
        let end = run.start + run.len;
        while pfn < end {
            let pool = topo.pool_for(pfn).ok_or(PmemError::UnknownFrame(pfn))?;
            let mut lists = pool.lists.lock();
            while pfn < end && pfn <= pool.max {
                lists.free_page(pfn, 0)?;
                pfn += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn reclaim(&self, pages: u64) -> usize {
        PmemStats::bump(&self.stats.reclaim_calls);
        let wanted = usize::try_from(pages).unwrap_or(usize::MAX);
        self.vm.reclaim(self, wanted)
    }

    /// Free base pages on the free lists, excluding the reserve.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.topology()
            .pools
            .iter()
            .map(|p| p.lists.lock().free_pages())
            .sum()
    }

    #[must_use]
    pub fn free_pages_in_class(&self, class: usize) -> usize {
        if class >= self.geo.classes.count() {
            return 0;
        }
        self.topology()
            .pools
            .iter()
            .map(|p| p.lists.lock().free_in_class(class))
            .sum()
    }

    /// State of a single frame.
    #[must_use]
    pub fn page_state(&self, pfn: Pfn) -> Option<PageState> {
        let topo = self.topology();
        let pool = topo.pool_for(pfn)?;
        pool.lists.lock().state_of(pfn)
    }

    #[must_use]
    pub fn io_pool_len(&self) -> usize {
        self.reserve.lock().len()
    }

    /// A copy of the reserve, in address order.
    #[must_use]
    pub fn io_pool_frames(&self) -> Vec<Pfn> {
        self.reserve.lock().frames().to_vec()
    }

    #[must_use]
    pub fn stats(&self) -> PmemStatsSnapshot {
        let mut snap = self.stats.snapshot();
        let (len, t) = {
            let r = self.reserve.lock();
            (r.len(), r.tunables())
        };
        snap.io_pool_count = len;
        snap.io_pool_min = t.min;
        snap.io_pool_max = t.max;
        snap.io_pool_low_water = t.low_water;
        snap.free_pages = self.free_pages();
        snap
    }

    /// Cross-check every free list, every descriptor and the reserve.
    ///
    /// Only meaningful while no other thread is allocating or freeing.
    ///
    /// # Errors
    /// The first inconsistency found, as an [`AuditError`].
    pub fn check_invariants(&self) -> Result<AuditReport, AuditError> {
        let topo = self.topology();
        let mut report = AuditReport::default();
        for pool in &topo.pools {
            let tally = pool.lists.lock().audit()?;
            report.free_pages += tally.free;
            report.io_pool_pages += tally.io_pool;
            report.allocated_pages += tally.allocated;
        }

        let frames = {
            let r = self.reserve.lock();
            r.check_sorted().map_err(AuditError::ReserveUnsorted)?;
            r.frames().to_vec()
        };
        for &pfn in &frames {
            let state = topo
                .pool_for(pfn)
                .and_then(|p| p.lists.lock().state_of(pfn));
            if state != Some(PageState::IoPool) {
                return Err(AuditError::StateMismatch { pfn });
            }
        }
        if frames.len() as u64 != report.io_pool_pages {
            return Err(AuditError::ReserveCount {
                held: frames.len(),
                flagged: report.io_pool_pages,
            });
        }
        Ok(report)
    }
}

impl<V: VmLayer, O: RangeOrdering, E: ColorEquivalence> PageFreer for PhysMem<V, O, E> {
    fn free(&self, pages: &[PageRef]) -> Result<(), PmemError> {
        Self::free(self, pages)
    }

    fn free_run(&self, run: PageRun) -> Result<(), PmemError> {
        Self::free_run(self, run)
    }
}
