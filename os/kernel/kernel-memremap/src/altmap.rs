//! Pre-reserved storage for a region's own per-page metadata.
//!
//! Describing N pages needs `memmap_pages(N)` pages of descriptors. Taking
//! those from the general allocator while the region is being added to the
//! allocator's domain is a bootstrap cycle; under memory pressure during
//! hotplug it can deadlock. An altmap carves the descriptor storage out of
//! the front of the region itself:
//!
//! ```text
//! base_pfn
//! │◄─ reserve ─►│◄──────────── free ─────────────►│◄── device pages ──►
//! │ driver use  │ align │ alloc (memmap) │ unused  │
//!               └───────── next_pfn ─────┘
//! ```

use kernel_memory_addresses::Pfn;

/// Pre-allocated storage for the memory map of a device region.
///
/// - `base_pfn`: first frame of the whole mapping.
/// - `reserve`: frames mapped but reserved for driver use.
/// - `free`: frames set aside for memmap storage.
/// - `align`: frames skipped to satisfy allocation alignment.
/// - `alloc`: frames handed out so far.
///
/// Invariant: `alloc + align <= free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmemAltmap {
    base_pfn: Pfn,
    reserve: u64,
    free: u64,
    align: u64,
    alloc: u64,
}

impl VmemAltmap {
    #[must_use]
    pub const fn new(base_pfn: Pfn, reserve: u64, free: u64) -> Self {
        Self {
            base_pfn,
            reserve,
            free,
            align: 0,
            alloc: 0,
        }
    }

    #[must_use]
    pub const fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    #[must_use]
    pub const fn reserve(&self) -> u64 {
        self.reserve
    }

    #[must_use]
    pub const fn free(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub const fn align(&self) -> u64 {
        self.align
    }

    #[must_use]
    pub const fn alloc(&self) -> u64 {
        self.alloc
    }

    /// Frames still available for metadata.
    #[must_use]
    pub const fn nr_free(&self) -> u64 {
        self.free.saturating_sub(self.alloc.saturating_add(self.align))
    }

    /// Frames covered by the reserve and the metadata area together, or
    /// `None` if they do not fit in a frame count.
    #[must_use]
    pub const fn carve_out(&self) -> Option<u64> {
        self.reserve.checked_add(self.free)
    }

    /// First frame after the carve-out, where device pages begin.
    ///
    /// `None` if the carve-out runs past the last frame number.
    #[must_use]
    pub const fn first_device_pfn(&self) -> Option<Pfn> {
        match self.carve_out() {
            Some(n) => match self.base_pfn.as_u64().checked_add(n) {
                Some(pfn) => Some(Pfn::new(pfn)),
                None => None,
            },
            None => None,
        }
    }

    fn next_pfn(&self) -> Option<u64> {
        self.base_pfn
            .as_u64()
            .checked_add(self.reserve)?
            .checked_add(self.alloc)?
            .checked_add(self.align)
    }

    /// Take `nr_pfns` frames, naturally aligned to the lowest set bit of
    /// `nr_pfns`.
    ///
    /// Returns the first frame, or `None` without touching any counter when
    /// the aligned request does not fit.
    pub(crate) fn alloc_pages(&mut self, nr_pfns: u64) -> Option<Pfn> {
        debug_assert!(nr_pfns > 0, "zero-sized altmap allocation");
        let pfn = self.next_pfn()?;
        let nr_align = 1u64 << nr_pfns.trailing_zeros();
        let nr_align = pfn.checked_next_multiple_of(nr_align)? - pfn;
        if nr_pfns.checked_add(nr_align)? > self.nr_free() {
            return None;
        }
        self.alloc += nr_pfns;
        self.align += nr_align;
        Some(Pfn::new(pfn + nr_align))
    }

    /// Give back alignment padding taken by [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Panics
    /// If more padding is returned than was taken.
    pub(crate) fn release_alignment(&mut self, nr_pfns: u64) {
        assert!(
            nr_pfns <= self.align,
            "altmap: releasing {nr_pfns} alignment pages, only {} taken",
            self.align
        );
        self.align -= nr_pfns;
    }
}

/// Number of frames from `base_pfn` that are consumed: the driver reserve
/// plus everything allocated for metadata so far.
///
/// Zero without an altmap, and always zero when device memory support is
/// not built.
#[must_use]
pub fn vmem_altmap_offset(altmap: Option<&VmemAltmap>) -> u64 {
    if !cfg!(feature = "zone-device") {
        return 0;
    }
    altmap.map_or(0, |a| a.reserve.saturating_add(a.alloc + a.align))
}

/// Return `nr_pfns` metadata frames to the altmap.
///
/// A no-op when device memory support is not built.
///
/// # Panics
/// If more frames are returned than are allocated; that is a metadata
/// double free.
pub fn vmem_altmap_free(altmap: &mut VmemAltmap, nr_pfns: u64) {
    if !cfg!(feature = "zone-device") {
        return;
    }
    assert!(
        nr_pfns <= altmap.alloc,
        "vmem_altmap_free: returning {nr_pfns} pages, only {} allocated",
        altmap.alloc
    );
    altmap.alloc -= nr_pfns;
}

#[cfg(all(test, feature = "zone-device"))]
mod tests {
    use super::*;

    #[test]
    fn offset_without_altmap_is_zero() {
        assert_eq!(vmem_altmap_offset(None), 0);
    }

    #[test]
    fn offset_starts_at_reserve() {
        let a = VmemAltmap::new(Pfn::new(0x100), 2, 8);
        assert_eq!(vmem_altmap_offset(Some(&a)), 2);
        assert_eq!(a.first_device_pfn(), Some(Pfn::new(0x10a)));
    }

    #[test]
    fn allocation_is_naturally_aligned() {
        // next pfn is 0x101; a 2-page request must start on an even frame.
        let mut a = VmemAltmap::new(Pfn::new(0x100), 1, 8);
        assert_eq!(a.alloc_pages(2), Some(Pfn::new(0x102)));
        assert_eq!(a.alloc(), 2);
        assert_eq!(a.align(), 1);
        assert_eq!(a.nr_free(), 5);
        assert_eq!(vmem_altmap_offset(Some(&a)), 4);
    }

    #[test]
    fn oversized_carve_out_does_not_wrap() {
        let mut a = VmemAltmap::new(Pfn::new(0x1000), u64::MAX, 1);
        assert_eq!(a.carve_out(), None);
        assert_eq!(a.first_device_pfn(), None);
        assert_eq!(a.alloc_pages(1), None);

        let mut top = VmemAltmap::new(Pfn::new(u64::MAX - 1), 1, 4);
        assert_eq!(top.carve_out(), Some(5));
        assert_eq!(top.first_device_pfn(), None);
        let before = top;
        assert_eq!(top.alloc_pages(2), None);
        assert_eq!(top, before);
    }

    #[test]
    fn failed_allocation_changes_nothing() {
        let mut a = VmemAltmap::new(Pfn::new(0x100), 0, 3);
        let before = a;
        assert_eq!(a.alloc_pages(4), None);
        assert_eq!(a, before);
        assert_eq!(a.alloc_pages(3), Some(Pfn::new(0x100)));
        assert_eq!(a.alloc_pages(1), None);
    }

    #[test]
    fn free_then_offset_reflects_exact_count() {
        let mut a = VmemAltmap::new(Pfn::new(0x200), 4, 16);
        for n in [1, 3, 4] {
            a.alloc_pages(n).unwrap();
        }
        let mut offset = vmem_altmap_offset(Some(&a));
        for n in [2, 5, 1] {
            vmem_altmap_free(&mut a, n);
            let now = vmem_altmap_offset(Some(&a));
            assert_eq!(offset - now, n);
            offset = now;
        }
        assert_eq!(a.alloc(), 0);
        assert!(a.alloc() <= a.free());
    }

    #[test]
    #[should_panic(expected = "only 1 allocated")]
    fn over_free_is_a_contract_violation() {
        let mut a = VmemAltmap::new(Pfn::new(0), 0, 4);
        a.alloc_pages(1).unwrap();
        vmem_altmap_free(&mut a, 2);
    }
}
