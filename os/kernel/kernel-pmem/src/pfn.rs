use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Base page shift (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// First frame at or above 16 MiB (legacy ISA DMA limit).
pub const PFN_16M: u64 = 0x1000;

/// First frame at or above 2 GiB.
pub const PFN_2G: u64 = 0x8_0000;

/// First frame at or above 4 GiB (32-bit DMA limit).
pub const PFN_4G: u64 = 0x10_0000;

/// Physical frame number.
///
/// Index of a [`PAGE_SIZE`] unit of physical memory. Frame numbers of
/// configured memory are bounded well below `u64::MAX`, so adding a run
/// length never wraps.
///
/// ### Examples
/// ```rust
/// # use kernel_pmem::*;
/// let pfn = Pfn::from_phys(0x0123_4567);
/// assert_eq!(pfn, Pfn::new(0x1234));
/// assert_eq!(pfn.phys_addr(), 0x0123_4000);
/// assert!(Pfn::new(0x1000).is_aligned(0x1000));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// The frame containing physical byte address `pa`.
    #[inline]
    #[must_use]
    pub const fn from_phys(pa: u64) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical byte address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// `align` is in pages and must be a power of two.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Round up to a multiple of `align` pages (power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + (align - 1)) & !(align - 1))
    }

    /// Round down to a multiple of `align` pages (power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Number of frames from `base` up to `self`.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, base: Self) -> u64 {
        self.0 - base.0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn(0x{:X})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u64> for Pfn {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Pfn> for u64 {
    #[inline]
    fn from(p: Pfn) -> Self {
        p.as_u64()
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Pfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// NUMA memory node identifier.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u16);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl From<u16> for NodeId {
    #[inline]
    fn from(v: u16) -> Self {
        Self(v)
    }
}
