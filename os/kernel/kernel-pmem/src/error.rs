use crate::pfn::{NodeId, Pfn};

/// Log the broken invariant and stop the current execution context.
///
/// Free-list corruption cannot be recovered from without risking handing the
/// same frame out twice.
macro_rules! invariant_violation {
    ($($arg:tt)+) => {{
        ::log::error!("pmem invariant violated: {}", ::core::format_args!($($arg)+));
        ::core::panic!("pmem invariant violated: {}", ::core::format_args!($($arg)+))
    }};
}

pub(crate) use invariant_violation;

/// Recoverable allocator errors, returned to the immediate caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmemError {
    /// No configured memory can ever satisfy the request.
    #[error("constraint cannot be satisfied by any configured memory")]
    ConstraintUnsatisfiable,
    #[error("invalid DMA constraint: {0}")]
    InvalidConstraint(&'static str),
    /// Retries and reclamation were exhausted.
    #[error("insufficient free memory")]
    InsufficientMemory,
    /// The request needs to wait for memory but the caller may not block.
    #[error("allocation would block")]
    WouldBlock,
    #[error("frame {0} is not allocated")]
    NotAllocated(Pfn),
    #[error("frame {0} is not managed by this allocator")]
    UnknownFrame(Pfn),
    #[error("size class {0} is not configured")]
    InvalidSizeClass(u8),
    #[error("{0} is not configured")]
    UnknownNode(NodeId),
    #[error("color {color} out of range for size class {szc}")]
    InvalidColor { color: u32, szc: u8 },
}

/// Node configuration errors, fatal at init and reported on hot-add.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeTableError {
    #[error("no memory nodes configured")]
    NoNodes,
    #[error("{0} has an empty or inverted extent")]
    EmptyExtent(NodeId),
    #[error("{0} is configured twice")]
    DuplicateNode(NodeId),
    #[error("{a} and {b} have overlapping extents")]
    Overlap { a: NodeId, b: NodeId },
    #[error("{0} spans more frames than a page arena can index")]
    ExtentTooLarge(NodeId),
    #[error("range classes must be strictly descending and end at frame 0")]
    BadClasses,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("page colors must be a power of two of at least 16, got {0}")]
    PageColors(u32),
    #[error("CPU page colors must be a power of two, got {0}")]
    CpuPageColors(u32),
    #[error("color equivalence must be a power of two, got {0}")]
    ColorEquiv(u32),
    #[error("size classes must start at shift 0 and strictly increase")]
    SizeClasses,
    #[error("contiguous retry limit must be at least 1")]
    RetryLimit,
    #[error("IO pool window or percentage is invalid")]
    IoPoolWindow,
    #[error("IO pool watermarks out of order: min {min}, low water {low_water}, max {max}")]
    IoPoolWatermarks {
        min: usize,
        low_water: usize,
        max: usize,
    },
}

/// Construction errors of [`PhysMem`](crate::PhysMem).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmemInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ranges(#[from] RangeTableError),
}

/// Inconsistency found by [`PhysMem::check_invariants`](crate::PhysMem::check_invariants).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("frame {0} is in more than one container")]
    Duplicate(Pfn),
    #[error("frame {pfn} has state flags that do not match its container")]
    StateMismatch { pfn: Pfn },
    #[error("frame {pfn} sits in the wrong bucket")]
    WrongBucket { pfn: Pfn },
    #[error("{node} class {class} size class {szc}: counter {counted} but {listed} listed")]
    CounterMismatch {
        node: NodeId,
        class: usize,
        szc: u8,
        counted: usize,
        listed: usize,
    },
    #[error("broken list links at frame {0}")]
    BrokenLink(Pfn),
    #[error("IO pool reserve is not strictly sorted at frame {0}")]
    ReserveUnsorted(Pfn),
    #[error("frame {0} is flagged free but not listed")]
    Orphan(Pfn),
    #[error("IO pool reserve holds {held} frames but {flagged} are flagged")]
    ReserveCount { held: usize, flagged: u64 },
}
