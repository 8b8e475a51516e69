//! # Physical Page Allocator
//!
//! Hands out physical page frames subject to three independent constraints:
//!
//! * **NUMA locality**: every node owns its own free lists and the caller can
//!   name a preferred node.
//! * **Cache color**: pages are bucketed by the cache-associativity class
//!   their physical address maps to, and consecutive requests rotate through
//!   the colors.
//! * **DMA reachability**: contiguous runs can be requested inside an address
//!   window, with alignment and segment-boundary limits.
//!
//! ## Architecture
//!
//! ```text
//!        alloc()                         alloc_contig()
//!           │                                  │
//!           │                    ┌─────────────▼─────────────┐
//!           │                    │      IO Pool Reserve      │  sorted low frames,
//!           │                    │  (binary-searched slice)  │  never blocks
//!           │                    └─────────────┬─────────────┘
//!           │                                  │ miss
//!           │                    ┌─────────────▼─────────────┐
//!           │                    │   Contiguous-Run Search   │  restarts on gaps,
//!           │                    │  (window-ordered ranges)  │  bounded retries
//!           │                    └─────────────┬─────────────┘
//! ┌─────────▼──────────────────────────────────▼─────────────┐
//! │        Free-List Pool  [range class][size class][color]   │  one per node
//! └─────────▲───────────────────────────────────▲────────────┘
//!           │                                   │
//! ┌─────────┴────────┐               ┌──────────┴──────────┐
//! │  Color Selector  │               │     Range Table     │  node x address class
//! └──────────────────┘               └─────────────────────┘
//! ```
//!
//! All state lives in one [`PhysMem`] value. Three lock domains exist (node
//! free lists, topology, reserve) and at most one lock is held at any time.
//!
//! ## Usage
//! ```rust
//! use kernel_pmem::{DmaConstraint, NodeConfig, NoReclaim, PhysMem, Pfn, PmemConfig};
//!
//! let nodes = [NodeConfig::new(0, 0, 0x1fff)];
//! let pmem = PhysMem::new(PmemConfig::new(), &nodes, NoReclaim).unwrap();
//! pmem.seed_free(Pfn::new(0x10), Pfn::new(0x2000));
//!
//! let run = pmem
//!     .alloc_contig(4, DmaConstraint::below_16m().with_align(4), false)
//!     .unwrap();
//! assert_eq!(run.start.as_u64() % 4, 0);
//! pmem.free_run(run).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod color;
mod config;
mod contig;
mod error;
mod freelist;
mod io_pool;
mod page;
mod pfn;
mod pmem;
mod range;
mod stats;
mod vm;

pub use color::{ColorEquivalence, ColorOrder, ColorSelector, NoEquivalence, StrideEquivalence};
pub use config::{
    DEFAULT_CONTIG_RETRY_LIMIT, DEFAULT_DESFREE_4G_SHIFT, DEFAULT_DESFREE_LOW,
    DEFAULT_IO_POOL_MAX_REQUEST, DEFAULT_IO_POOL_MIN, DEFAULT_IO_POOL_PCT,
    DEFAULT_SIZE_CLASS_SHIFTS, IoPoolConfig, MAX_SIZE_CLASSES, NodeConfig, PAGE_COLORS_MIN,
    PmemConfig,
};
pub use contig::DmaConstraint;
pub use error::{AuditError, ConfigError, PmemError, PmemInitError, RangeTableError};
pub use io_pool::{IoPoolReserve, IoPoolTunables};
pub use page::{PageRef, PageRun, PageState};
pub use pfn::{NodeId, PAGE_SHIFT, PAGE_SIZE, PFN_2G, PFN_4G, PFN_16M, Pfn};
pub use pmem::{AuditReport, PhysMem};
pub use range::{
    HighestFirst, RangeCandidate, RangeClasses, RangeDescriptor, RangeOrdering, RangeTable,
    SmallestSpanFirst, build_ranges,
};
pub use stats::PmemStatsSnapshot;
pub use vm::{NoReclaim, PageFreer, VmLayer};
