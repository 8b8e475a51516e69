use kernel_pmem::{
    DmaConstraint, NoReclaim, NodeConfig, NodeId, PageRef, PageRun, Pfn, PhysMem, PmemConfig,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

const THREADS: usize = 8;
const ROUNDS: usize = 200;

enum Held {
    Pages(Vec<PageRef>),
    Run(PageRun),
}

/// Tiny deterministic generator, one per thread.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

fn shared() -> Arc<PhysMem> {
    let nodes = [
        NodeConfig::new(0, 0, 0x1FFF),
        NodeConfig::new(1, 0x2000, 0x3FFF),
    ];
    let cfg = PmemConfig::new().with_desfree_low(0);
    let pmem = PhysMem::new(cfg, &nodes, NoReclaim).unwrap();
    pmem.seed_free(Pfn::new(0), Pfn::new(0x4000));
    pmem.io_pool_configure(16, 64, 32).unwrap();
    pmem.io_pool_populate(64);
    Arc::new(pmem)
}

fn claim(owned: &Mutex<HashSet<Pfn>>, frames: impl Iterator<Item = Pfn>) {
    let mut owned = owned.lock().unwrap();
    for pfn in frames {
        assert!(owned.insert(pfn), "{pfn} handed out twice");
    }
}

fn disown(owned: &Mutex<HashSet<Pfn>>, frames: impl Iterator<Item = Pfn>) {
    let mut owned = owned.lock().unwrap();
    for pfn in frames {
        assert!(owned.remove(&pfn));
    }
}

fn worker(pmem: &PhysMem, owned: &Mutex<HashSet<Pfn>>, seed: u64, hint: NodeId) {
    let mut rng = Lcg(seed);
    let mut held = Vec::new();

    for _ in 0..ROUNDS {
        match rng.next_u64() % 4 {
            0 | 1 => {
                let n = (rng.next_u64() % 4 + 1) as usize;
                if let Ok(pages) = pmem.alloc(n, 0, Some(hint), false) {
                    claim(owned, pages.iter().map(|p| p.pfn));
                    held.push(Held::Pages(pages));
                }
            }
            2 => {
                let c = DmaConstraint::below_16m().with_align(4).with_max_segment(64);
                if let Ok(run) = pmem.alloc_contig(4 + rng.next_u64() % 8, c, false) {
                    assert!(run.start.is_aligned(4));
                    claim(owned, run.iter());
                    held.push(Held::Run(run));
                }
            }
            _ => {
                if held.is_empty() {
                    continue;
                }
                let i = (rng.next_u64() as usize) % held.len();
                release(pmem, owned, held.swap_remove(i));
            }
        }
    }

    for h in held {
        release(pmem, owned, h);
    }
}

fn release(pmem: &PhysMem, owned: &Mutex<HashSet<Pfn>>, held: Held) {
    match held {
        Held::Pages(pages) => {
            disown(owned, pages.iter().map(|p| p.pfn));
            pmem.free(&pages).unwrap();
        }
        Held::Run(run) => {
            disown(owned, run.iter());
            pmem.free_run(run).unwrap();
        }
    }
}

#[test]
fn mixed_workload_keeps_every_frame_accounted_for() {
    let pmem = shared();
    let total = pmem.free_pages() + pmem.io_pool_len();
    let owned = Arc::new(Mutex::new(HashSet::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pmem = Arc::clone(&pmem);
            let owned = Arc::clone(&owned);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                #[allow(clippy::cast_possible_truncation)]
                let hint = NodeId((t % 2) as u16);
                worker(&pmem, &owned, t as u64 + 1, hint);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(owned.lock().unwrap().is_empty());
    assert_eq!(pmem.free_pages() + pmem.io_pool_len(), total);
    let report = pmem.check_invariants().unwrap();
    assert_eq!(report.allocated_pages, 0);
}

#[test]
fn hot_add_while_allocating() {
    let pmem = shared();
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pmem = Arc::clone(&pmem);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut got = 0;
                for _ in 0..ROUNDS {
                    if let Ok(pages) = pmem.alloc(1, 0, None, false) {
                        got += 1;
                        pmem.free(&pages).unwrap();
                    }
                }
                got
            })
        })
        .collect();

    barrier.wait();
    pmem.add_node(NodeConfig::new(2, 0x4000, 0x4FFF)).unwrap();
    assert_eq!(pmem.seed_free(Pfn::new(0x4000), Pfn::new(0x5000)), 0x1000);

    for h in handles {
        assert_eq!(h.join().unwrap(), ROUNDS);
    }
    assert_eq!(pmem.ranges().nodes().len(), 3);
    let report = pmem.check_invariants().unwrap();
    assert_eq!(report.allocated_pages, 0);
    assert_eq!(report.free_pages + report.io_pool_pages, 0x5000);
}
