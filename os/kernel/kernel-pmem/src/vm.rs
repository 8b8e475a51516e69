//! Seam to the virtual-memory layer above the allocator.

use crate::error::PmemError;
use crate::page::{PageRef, PageRun};
use crate::pfn::Pfn;

/// Gives pages back to the allocator.
///
/// Handed to [`VmLayer::reclaim`] so the VM layer can free what it evicts
/// without holding a reference to the allocator itself.
pub trait PageFreer {
    /// # Errors
    /// Same as [`PhysMem::free`](crate::PhysMem::free).
    fn free(&self, pages: &[PageRef]) -> Result<(), PmemError>;

    /// # Errors
    /// Same as [`PhysMem::free_run`](crate::PhysMem::free_run).
    fn free_run(&self, run: PageRun) -> Result<(), PmemError>;
}

/// Services the allocator needs from the VM layer.
///
/// Both methods are called without any allocator lock held.
pub trait VmLayer: Send + Sync {
    /// Whether `pfn` is unused by anything outside the allocator and may be
    /// placed in the IO pool reserve.
    fn is_idle(&self, pfn: Pfn) -> bool {
        let _ = pfn;
        true
    }

    /// Try to free about `wanted` pages through `freer`. Only called on
    /// paths whose caller may block. Returns how many pages were freed, as
    /// a hint.
    fn reclaim(&self, freer: &dyn PageFreer, wanted: usize) -> usize {
        let _ = (freer, wanted);
        0
    }
}

/// A VM layer with nothing to reclaim.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoReclaim;

impl VmLayer for NoReclaim {}
