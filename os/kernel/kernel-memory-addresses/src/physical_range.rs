use crate::{PAGE_SHIFT, Pfn, PhysicalAddress, is_page_aligned};
use core::fmt;

/// A half-open physical byte range `[start, start + len)`.
///
/// This is the unit a device hands to the memory manager: a BAR, a
/// persistent memory namespace, or a slice of accelerator memory.
///
/// ### Invariants
/// - `start + len` does not overflow (checked in [`PhysicalRange::try_new`],
///   saturated in [`PhysicalRange::new`]).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    len: u64,
}

impl PhysicalRange {
    /// Creates a range, clamping `len` so that the end does not wrap.
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, len: u64) -> Self {
        let max = u64::MAX - start.as_u64();
        let len = if len > max { max } else { len };
        Self { start, len }
    }

    /// Creates a range, returning `None` if `start + len` overflows.
    #[inline]
    #[must_use]
    pub const fn try_new(start: PhysicalAddress, len: u64) -> Option<Self> {
        match start.as_u64().checked_add(len) {
            Some(_) => Some(Self { start, len }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.len)
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Both ends fall on page boundaries.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.start.as_u64()) && is_page_aligned(self.len)
    }

    #[inline]
    #[must_use]
    pub const fn start_pfn(&self) -> Pfn {
        self.start.pfn()
    }

    /// One past the last frame touched by the range.
    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        self.end().align_up().pfn()
    }

    #[inline]
    #[must_use]
    pub const fn nr_pages(&self) -> u64 {
        if self.len == 0 {
            return 0;
        }
        (self.end().align_up().as_u64() - self.start.align_down().as_u64()) >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start.as_u64() && pa.as_u64() < self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_pfn(&self, pfn: Pfn) -> bool {
        !self.is_empty()
            && pfn.as_u64() >= self.start_pfn().as_u64()
            && pfn.as_u64() < self.end_pfn().as_u64()
    }

    /// Two ranges overlap if they share at least one byte.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.as_u64() < other.end().as_u64()
            && other.start.as_u64() < self.end().as_u64()
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalRange[0x{:016X}..0x{:016X})",
            self.start.as_u64(),
            self.end().as_u64()
        )
    }
}

impl fmt::Display for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{})", self.start, self.end())
    }
}
