use kernel_pmem::{
    NoReclaim, NodeConfig, NodeId, PFN_4G, PageRef, PageState, Pfn, PhysMem, PmemConfig,
    PmemError, RangeTableError,
};
use std::collections::BTreeSet;

fn relaxed() -> PmemConfig {
    PmemConfig::new().with_desfree_low(0)
}

/// One fully seeded node of 1024 frames below 16 MiB.
fn one_node() -> PhysMem {
    let pmem = PhysMem::new(relaxed(), &[NodeConfig::new(0, 0, 0x3FF)], NoReclaim).unwrap();
    assert_eq!(pmem.seed_free(Pfn::new(0), Pfn::new(0x400)), 0x400);
    pmem
}

fn two_nodes(cfg: PmemConfig) -> PhysMem {
    let nodes = [
        NodeConfig::new(0, 0, 0x3FF),
        NodeConfig::new(1, 0x400, 0x7FF),
    ];
    let pmem = PhysMem::new(cfg, &nodes, NoReclaim).unwrap();
    pmem.seed_free(Pfn::new(0), Pfn::new(0x800));
    pmem
}

#[test]
fn pages_are_conserved() {
    let pmem = one_node();

    let pages = pmem.alloc(100, 0, None, false).unwrap();
    let distinct: BTreeSet<_> = pages.iter().map(|p| p.pfn).collect();
    assert_eq!(distinct.len(), 100);
    for p in &pages {
        assert_eq!(p.szc, 0);
        assert_eq!(pmem.page_state(p.pfn), Some(PageState::Allocated));
    }
    assert_eq!(pmem.free_pages(), 0x400 - 100);

    let report = pmem.check_invariants().unwrap();
    assert_eq!(report.allocated_pages, 100);
    assert_eq!(report.free_pages, 0x400 - 100);

    pmem.free(&pages).unwrap();
    assert_eq!(pmem.free_pages(), 0x400);
    assert_eq!(pmem.check_invariants().unwrap().allocated_pages, 0);
}

#[test]
fn consecutive_pages_rotate_colors() {
    let pmem = one_node();
    let pages = pmem.alloc(16, 0, None, false).unwrap();
    let colors: Vec<_> = pages
        .iter()
        .map(|p| pmem.colors().color_of(p.pfn, 0))
        .collect();
    assert_eq!(colors, (0..16).collect::<Vec<u32>>());
}

#[test]
fn preferred_color_is_honored() {
    let pmem = one_node();
    let pages = pmem.alloc_colored(8, 0, None, 5, false).unwrap();
    for p in &pages {
        assert_eq!(pmem.colors().color_of(p.pfn, 0), 5);
    }
}

#[test]
fn exhausted_color_falls_back_to_another() {
    let pmem = PhysMem::new(relaxed(), &[NodeConfig::new(0, 0, 0xFF)], NoReclaim).unwrap();
    // Exactly one frame of each color.
    pmem.seed_free(Pfn::new(0), Pfn::new(16));

    let first = pmem.alloc_colored(1, 0, None, 3, false).unwrap();
    assert_eq!(first[0].pfn, Pfn::new(3));
    let second = pmem.alloc_colored(1, 0, None, 3, false).unwrap();
    assert_ne!(second[0].pfn, Pfn::new(3));
    assert_eq!(pmem.free_pages(), 14);
}

#[test]
fn node_hint_is_tried_first() {
    let pmem = two_nodes(relaxed());

    let pages = pmem.alloc(8, 0, Some(NodeId(1)), false).unwrap();
    assert!(pages.iter().all(|p| p.pfn >= Pfn::new(0x400)));

    let pages = pmem.alloc(8, 0, None, false).unwrap();
    assert!(pages.iter().all(|p| p.pfn < Pfn::new(0x400)));

    assert_eq!(
        pmem.alloc(1, 0, Some(NodeId(7)), false),
        Err(PmemError::UnknownNode(NodeId(7)))
    );
}

#[test]
fn hinted_node_spills_over_when_empty() {
    let pmem = two_nodes(relaxed());
    let all_of_node1 = pmem.alloc(0x400, 0, Some(NodeId(1)), false).unwrap();
    assert!(all_of_node1.iter().all(|p| p.pfn >= Pfn::new(0x400)));

    let spilled = pmem.alloc(1, 0, Some(NodeId(1)), false).unwrap();
    assert!(spilled[0].pfn < Pfn::new(0x400));
}

#[test]
fn low_memory_is_kept_for_dma() {
    let nodes = [
        NodeConfig::new(0, 0, 0xFFF),
        NodeConfig::new(1, 0x1000, 0x1FFF),
    ];
    let guarded = PhysMem::new(PmemConfig::new(), &nodes, NoReclaim).unwrap();
    let unguarded = PhysMem::new(relaxed(), &nodes, NoReclaim).unwrap();
    for pmem in [&guarded, &unguarded] {
        // 256 pages below 16 MiB, under the default threshold.
        pmem.seed_free(Pfn::new(0), Pfn::new(0x100));
        pmem.seed_free(Pfn::new(0x1000), Pfn::new(0x2000));
    }

    let p = guarded.alloc(1, 0, Some(NodeId(0)), false).unwrap();
    assert!(p[0].pfn >= Pfn::new(0x1000));

    let p = unguarded.alloc(1, 0, Some(NodeId(0)), false).unwrap();
    assert!(p[0].pfn < Pfn::new(0x100));
}

/// Node 0 has 0x400 frames below 4 GiB and 0x200 above, node 1 has 0x400
/// frames above.
fn around_4g(cfg: PmemConfig) -> PhysMem {
    let nodes = [
        NodeConfig::new(0, PFN_4G - 0x400, PFN_4G + 0x1FF),
        NodeConfig::new(1, PFN_4G + 0x200, PFN_4G + 0x5FF),
    ];
    let pmem = PhysMem::new(cfg, &nodes, NoReclaim).unwrap();
    pmem.seed_free(Pfn::new(PFN_4G - 0x400), Pfn::new(PFN_4G + 0x600));
    pmem
}

#[test]
fn memory_below_4g_is_kept_back_when_scarce() {
    let pmem = around_4g(PmemConfig::new());
    let node0 = Some(NodeId(0));
    let below = |p: &PageRef| p.pfn < Pfn::new(PFN_4G);

    let high = pmem.alloc(0x200, 0, node0, false).unwrap();
    assert!(!high.iter().any(below));

    // Down to 0x400 >> 4 free pages below 4 GiB.
    let low = pmem.alloc(0x3C0, 0, node0, false).unwrap();
    assert!(low.iter().all(below));

    let p = pmem.alloc(1, 0, node0, false).unwrap();
    assert!(p[0].pfn >= Pfn::new(PFN_4G + 0x200));

    // Once node 1 is exhausted the reserve is used after all.
    let rest = pmem.alloc(0x3FF, 0, None, false).unwrap();
    assert!(!rest.iter().any(below));
    let last = pmem.alloc(0x40, 0, node0, false).unwrap();
    assert!(last.iter().all(below));
    assert_eq!(pmem.free_pages(), 0);
}

#[test]
fn below_4g_guard_can_be_turned_off() {
    let cfg = PmemConfig::new().with_desfree_4g_shift(64);
    let pmem = around_4g(cfg);
    let node0 = Some(NodeId(0));

    pmem.alloc(0x200 + 0x3C0, 0, node0, false).unwrap();
    let p = pmem.alloc(1, 0, node0, false).unwrap();
    assert!(p[0].pfn < Pfn::new(PFN_4G));
}

#[test]
fn low_memory_is_used_as_a_last_resort() {
    let pmem = PhysMem::new(PmemConfig::new(), &[NodeConfig::new(0, 0, 0xFFF)], NoReclaim)
        .unwrap();
    pmem.seed_free(Pfn::new(0), Pfn::new(0x100));
    let p = pmem.alloc(1, 0, None, false).unwrap();
    assert!(p[0].pfn < Pfn::new(0x100));
}

#[test]
fn large_pages_split_but_never_merge() {
    let pmem = one_node();

    let large = pmem.alloc(1, 1, None, false).unwrap();
    let head = large[0].pfn;
    assert!(head.is_aligned(512));
    assert_eq!(pmem.page_state(head + 511), Some(PageState::Allocated));
    assert_eq!(pmem.free_pages(), 0x200);
    assert_eq!(pmem.stats().splits, 0);

    // The last large page is split to serve a base page.
    let small = pmem.alloc(1, 0, None, false).unwrap();
    assert_eq!(pmem.stats().splits, 1);
    assert_eq!(pmem.free_pages(), 0x1FF);
    assert_eq!(pmem.alloc(1, 1, None, false), Err(PmemError::WouldBlock));

    pmem.free(&small).unwrap();
    assert_eq!(pmem.alloc(1, 1, None, false), Err(PmemError::WouldBlock));

    // Large pages go back whole and can be handed out again.
    pmem.free(&large).unwrap();
    assert_eq!(pmem.free_pages(), 0x400);
    let again = pmem.alloc(1, 1, None, false).unwrap();
    assert_eq!(again[0].pfn, head);
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn failed_requests_roll_back() {
    let pmem = PhysMem::new(PmemConfig::new(), &[NodeConfig::new(0, 0, 0xFF)], NoReclaim).unwrap();
    pmem.seed_free(Pfn::new(0), Pfn::new(12));
    let held = pmem.alloc(8, 0, None, false).unwrap();

    assert_eq!(pmem.alloc(8, 0, None, false), Err(PmemError::WouldBlock));
    assert_eq!(pmem.free_pages(), 4);
    assert_eq!(pmem.stats().reclaim_calls, 0);

    assert_eq!(pmem.alloc(8, 0, None, true), Err(PmemError::InsufficientMemory));
    assert_eq!(pmem.free_pages(), 4);
    assert_eq!(
        pmem.stats().reclaim_calls,
        u64::from(pmem.config().contig_retry_limit)
    );
    pmem.free(&held).unwrap();
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn requests_beyond_managed_memory_fail_at_once() {
    let pmem = one_node();

    assert_eq!(
        pmem.alloc(0x401, 0, None, false),
        Err(PmemError::InsufficientMemory)
    );
    assert_eq!(pmem.alloc(3, 1, None, true), Err(PmemError::InsufficientMemory));
    assert_eq!(
        pmem.alloc(usize::MAX, 0, None, false),
        Err(PmemError::InsufficientMemory)
    );
    assert_eq!(
        pmem.alloc(usize::MAX, 1, None, true),
        Err(PmemError::InsufficientMemory)
    );
    assert_eq!(pmem.stats().reclaim_calls, 0);
    assert_eq!(pmem.free_pages(), 0x400);

    // Everything there is can still be had.
    let all = pmem.alloc(0x400, 0, None, false).unwrap();
    assert_eq!(all.len(), 0x400);
    pmem.free(&all).unwrap();
}

#[test]
fn failed_request_puts_split_large_pages_back() {
    let pmem = PhysMem::new(relaxed(), &[NodeConfig::new(0, 0, 0x7FF)], NoReclaim).unwrap();
    pmem.seed_free(Pfn::new(0x200), Pfn::new(0x400));
    pmem.seed_free(Pfn::new(0x600), Pfn::new(0x608));

    let held = pmem.alloc(2, 0, None, false).unwrap();
    assert!(held.iter().all(|p| p.pfn >= Pfn::new(0x600)));

    // The six loose pages go first, then the large page is split and runs
    // dry one page short.
    assert_eq!(pmem.alloc(0x207, 0, None, false), Err(PmemError::WouldBlock));
    assert_eq!(pmem.stats().splits, 1);
    assert_eq!(pmem.stats().merges, 1);
    assert_eq!(pmem.free_pages(), 0x206);

    let large = pmem.alloc(1, 1, None, false).unwrap();
    assert_eq!(large[0].pfn, Pfn::new(0x200));
    assert!(pmem.check_invariants().is_ok());
}

#[test]
fn bad_frees_are_rejected() {
    let pmem = one_node();
    let pages = pmem.alloc(2, 0, None, false).unwrap();
    pmem.free(&pages[..1]).unwrap();

    // The first page is already free; the second is untouched.
    assert_eq!(pmem.free(&pages), Err(PmemError::NotAllocated(pages[0].pfn)));
    assert_eq!(pmem.page_state(pages[1].pfn), Some(PageState::Allocated));
    pmem.free(&pages[1..]).unwrap();

    let large = pmem.alloc(1, 1, None, false).unwrap();
    let wrong_size = PageRef {
        pfn: large[0].pfn,
        szc: 0,
    };
    assert_eq!(pmem.free(&[wrong_size]), Err(PmemError::NotAllocated(large[0].pfn)));
    let constituent = PageRef {
        pfn: large[0].pfn + 1,
        szc: 1,
    };
    assert_eq!(
        pmem.free(&[constituent]),
        Err(PmemError::NotAllocated(large[0].pfn + 1))
    );
}

#[test]
fn hot_added_node_serves_allocations() {
    let pmem = one_node();
    pmem.add_node(NodeConfig::new(1, 0x400, 0x7FF)).unwrap();
    assert_eq!(pmem.ranges().node_ranges(NodeId(1)).count(), 1);

    // Unavailable until seeded.
    assert_eq!(pmem.page_state(Pfn::new(0x400)), Some(PageState::Unavailable));
    assert_eq!(pmem.seed_free(Pfn::new(0x400), Pfn::new(0x800)), 0x400);
    assert_eq!(pmem.free_pages(), 0x800);

    let pages = pmem.alloc(4, 0, Some(NodeId(1)), false).unwrap();
    assert!(pages.iter().all(|p| p.pfn >= Pfn::new(0x400)));

    assert_eq!(
        pmem.add_node(NodeConfig::new(2, 0x700, 0x8FF)),
        Err(RangeTableError::Overlap {
            a: NodeId(1),
            b: NodeId(2)
        })
    );
    assert_eq!(
        pmem.add_node(NodeConfig::new(1, 0x1000, 0x1FFF)),
        Err(RangeTableError::DuplicateNode(NodeId(1)))
    );
    assert!(pmem.check_invariants().is_ok());
}
