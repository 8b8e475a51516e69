use kernel_pmem::{
    ConfigError, DmaConstraint, IoPoolConfig, NoReclaim, NodeConfig, PageState, Pfn, PhysMem,
    PmemConfig, VmLayer,
};

/// Only odd frames are idle.
struct OddIdle;

impl VmLayer for OddIdle {
    fn is_idle(&self, pfn: Pfn) -> bool {
        pfn.as_u64() % 2 == 1
    }
}

/// Frames below the bound are in use by the VM layer.
struct BusyBelow(u64);

impl VmLayer for BusyBelow {
    fn is_idle(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.0
    }
}

fn setup_with<V: VmLayer>(cfg: PmemConfig, vm: V) -> PhysMem<V> {
    let pmem = PhysMem::new(cfg, &[NodeConfig::new(0, 0, 0x1FFF)], vm).unwrap();
    pmem.seed_free(Pfn::new(0x10), Pfn::new(0x2000));
    pmem.io_pool_configure(8, 32, 16).unwrap();
    pmem
}

fn setup() -> PhysMem {
    setup_with(PmemConfig::new(), NoReclaim)
}

fn frames(range: core::ops::Range<u64>) -> Vec<Pfn> {
    range.map(Pfn::new).collect()
}

#[test]
fn watermarks_follow_managed_memory() {
    let pmem = PhysMem::new(PmemConfig::new(), &[NodeConfig::new(0, 0, 0x1FFF)], NoReclaim)
        .unwrap();
    pmem.seed_free(Pfn::new(0x10), Pfn::new(0x2000));

    // 8176 pages: 2% is 162, above the floor of 128.
    let s = pmem.stats();
    assert_eq!((s.io_pool_min, s.io_pool_max, s.io_pool_low_water), (128, 162, 145));

    assert_eq!(
        pmem.io_pool_configure(10, 5, 7),
        Err(ConfigError::IoPoolWatermarks {
            min: 10,
            low_water: 7,
            max: 5
        })
    );
    pmem.io_pool_configure(1, 4, 2).unwrap();
    pmem.seed_free(Pfn::new(0), Pfn::new(0x10));
    assert_eq!(pmem.stats().io_pool_max, 4);
}

#[test]
fn populate_takes_the_lowest_free_frames() {
    let pmem = setup();
    let before = pmem.free_pages();

    assert_eq!(pmem.io_pool_populate(20), 20);
    assert_eq!(pmem.io_pool_frames(), frames(0x10..0x24));
    for pfn in 0x10..0x24 {
        assert_eq!(pmem.page_state(Pfn::new(pfn)), Some(PageState::IoPool));
    }
    assert_eq!(pmem.free_pages(), before - 20);

    let report = pmem.check_invariants().unwrap();
    assert_eq!(report.io_pool_pages, 20);
    assert_eq!(report.allocated_pages, 0);
}

#[test]
fn populate_stops_at_max() {
    let pmem = setup();
    assert_eq!(pmem.io_pool_populate(20), 20);
    assert_eq!(pmem.io_pool_populate(100), 12);
    assert_eq!(pmem.io_pool_len(), 32);
    assert_eq!(pmem.io_pool_populate(33), 0);
    assert_eq!(pmem.stats().io_pool_count, 32);
}

#[test]
fn busy_frames_are_skipped() {
    let pmem = setup_with(PmemConfig::new(), OddIdle);
    let before = pmem.free_pages();

    assert_eq!(pmem.io_pool_populate(10), 10);
    let expected: Vec<_> = (0..10).map(|i| Pfn::new(0x11 + 2 * i)).collect();
    assert_eq!(pmem.io_pool_frames(), expected);
    assert_eq!(pmem.stats().io_pool_rejects, 10);

    // Rejected frames went back to the free lists.
    assert_eq!(pmem.page_state(Pfn::new(0x10)), Some(PageState::Free));
    assert_eq!(pmem.free_pages(), before - 10);
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn populate_stays_inside_the_window() {
    let io_pool = IoPoolConfig {
        window_lo: Pfn::new(0x1000),
        ..IoPoolConfig::new()
    };
    let pmem = setup_with(PmemConfig::new().with_io_pool(io_pool), NoReclaim);
    pmem.io_pool_populate(4);
    assert_eq!(pmem.io_pool_frames(), frames(0x1000..0x1004));
}

#[test]
fn rejected_large_pages_stay_whole() {
    let io_pool = IoPoolConfig {
        window_lo: Pfn::new(0x200),
        ..IoPoolConfig::new()
    };
    let cfg = PmemConfig::new().with_io_pool(io_pool);
    let pmem = setup_with(cfg, BusyBelow(0x400));
    let before = pmem.free_pages();

    // Every frame of 0x200..0x400 is looked at and turned down.
    assert_eq!(pmem.io_pool_populate(4), 4);
    assert_eq!(pmem.io_pool_frames(), frames(0x400..0x404));
    let stats = pmem.stats();
    assert_eq!(stats.io_pool_rejects, 0x200);
    // The page the reserve took frames from stays split.
    assert_eq!(stats.merges, 1);
    assert_eq!(pmem.free_pages(), before - 4);
    assert!(pmem.check_invariants().is_ok());

    // Eight large pages above 16 MiB, six below, 0x200 among them.
    let large = pmem.alloc(14, 1, None, false).unwrap();
    assert!(large.iter().any(|p| p.pfn == Pfn::new(0x200)));
    assert!(large.iter().all(|p| p.pfn != Pfn::new(0x400)));
}

#[test]
fn shrink_gives_back_the_highest_frames() {
    let pmem = setup();
    let before = pmem.free_pages();
    pmem.io_pool_populate(20);

    assert_eq!(pmem.io_pool_shrink(5), 15);
    assert_eq!(pmem.io_pool_frames(), frames(0x10..0x15));
    assert_eq!(pmem.page_state(Pfn::new(0x15)), Some(PageState::Free));
    assert_eq!(pmem.free_pages(), before - 5);
    assert_eq!(pmem.io_pool_shrink(5), 0);
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn maintain_moves_towards_the_watermarks() {
    let pmem = setup();

    pmem.io_pool_maintain();
    assert_eq!(pmem.io_pool_len(), 16);
    pmem.io_pool_maintain();
    assert_eq!(pmem.io_pool_len(), 16);

    pmem.io_pool_populate(32);
    pmem.io_pool_configure(4, 10, 6).unwrap();
    pmem.io_pool_maintain();
    assert_eq!(pmem.io_pool_len(), 10);
    assert_eq!(pmem.io_pool_frames(), frames(0x10..0x1A));
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn small_requests_are_served_from_the_reserve() {
    let pmem = setup();
    pmem.io_pool_populate(32);

    let c = DmaConstraint::below_16m().with_align(4);
    let run = pmem.alloc_contig(4, c, false).unwrap();
    assert_eq!(run.start, Pfn::new(0x10));
    assert_eq!(pmem.stats().io_pool_hits, 1);
    assert_eq!(pmem.io_pool_len(), 28);
    for pfn in run.iter() {
        assert_eq!(pmem.page_state(pfn), Some(PageState::Allocated));
    }

    // Freed runs go to the free lists, not back into the reserve.
    pmem.free_run(run).unwrap();
    assert_eq!(pmem.page_state(Pfn::new(0x10)), Some(PageState::Free));
    assert_eq!(pmem.io_pool_len(), 28);
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn large_requests_bypass_the_reserve() {
    let pmem = setup();
    pmem.io_pool_populate(32);

    let run = pmem.alloc_contig(65, DmaConstraint::below_16m(), false).unwrap();
    assert!(run.start >= Pfn::new(0x30));
    let s = pmem.stats();
    assert_eq!((s.io_pool_hits, s.io_pool_misses), (0, 0));
    assert_eq!(pmem.io_pool_len(), 32);

    // Fits the request limit but not the window.
    let above = DmaConstraint::new(0x40_0000, 0xFFF_FFFF);
    pmem.alloc_contig(4, above, false).unwrap();
    assert_eq!(pmem.stats().io_pool_misses, 1);
}

#[test]
fn blocking_hit_refills_the_reserve() {
    let pmem = setup();
    pmem.io_pool_populate(16);

    let c = DmaConstraint::below_16m();
    let run = pmem.alloc_contig(4, c, true).unwrap();
    assert_eq!(run.start, Pfn::new(0x10));
    assert_eq!(pmem.io_pool_len(), 16);
    assert_eq!(pmem.io_pool_frames(), frames(0x14..0x24));
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn non_blocking_hit_leaves_the_reserve_low() {
    let pmem = setup();
    pmem.io_pool_populate(16);

    let run = pmem.alloc_contig(4, DmaConstraint::below_16m(), false).unwrap();
    assert_eq!(run.start, Pfn::new(0x10));
    assert_eq!(pmem.io_pool_len(), 12);
}
