//! Per-page descriptors and the page classification predicates.
//!
//! Every frame of a registered region (past the altmap carve-out) gets one
//! [`Page`]. The predicates below are what the rest of the memory manager
//! calls on its hot paths to decide how to treat a page; they read a single
//! tag, never take a lock, and collapse to `false` when the corresponding
//! memory type is not built in.

use crate::MemoryType;
use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::Pfn;

/// Reference count of a device page nobody uses.
///
/// Device pages never drop to zero while their region is registered; reaching
/// this floor is what hands the page back to the driver.
pub const DEVICE_PAGE_IDLE_REFCOUNT: usize = 1;

/// Which part of memory a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageZone {
    /// Ordinary system memory.
    Normal,
    /// Device memory; carries the owning region's type tag.
    Device(MemoryType),
}

/// Descriptor of one physical page.
#[derive(Debug)]
pub struct Page {
    pfn: Pfn,
    zone: PageZone,
    refcount: AtomicUsize,
}

impl Page {
    /// A descriptor for an ordinary RAM page.
    #[must_use]
    pub const fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            zone: PageZone::Normal,
            refcount: AtomicUsize::new(1),
        }
    }

    /// An idle device page of the given type.
    #[must_use]
    pub const fn new_device(pfn: Pfn, memory_type: MemoryType) -> Self {
        Self {
            pfn,
            zone: PageZone::Device(memory_type),
            refcount: AtomicUsize::new(DEVICE_PAGE_IDLE_REFCOUNT),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pfn(&self) -> Pfn {
        self.pfn
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> PageZone {
        self.zone
    }

    /// The owning region's type, for device pages.
    #[inline]
    #[must_use]
    pub const fn memory_type(&self) -> Option<MemoryType> {
        match self.zone {
            PageZone::Device(ty) => Some(ty),
            PageZone::Normal => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// A device page that nobody holds.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.refcount() == DEVICE_PAGE_IDLE_REFCOUNT
    }

    pub(crate) fn get(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "page {}: get on a freed page", self.pfn);
    }

    /// Drop one reference; `true` when the page fell back to the idle floor.
    ///
    /// # Panics
    /// If the count would go below the floor.
    pub(crate) fn put(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > DEVICE_PAGE_IDLE_REFCOUNT,
            "page {}: reference count underflow",
            self.pfn
        );
        prev - 1 == DEVICE_PAGE_IDLE_REFCOUNT
    }
}

/// The descriptors of one region, indexed by frame.
#[derive(Debug)]
pub struct Memmap {
    first_pfn: Pfn,
    pages: Box<[Page]>,
}

impl Memmap {
    /// Idle descriptors for `nr_pages` frames from `first_pfn`.
    ///
    /// Fails instead of aborting when the descriptor array can not be
    /// allocated.
    pub(crate) fn try_new(
        first_pfn: Pfn,
        nr_pages: usize,
        memory_type: MemoryType,
    ) -> Result<Self, TryReserveError> {
        let mut pages = Vec::new();
        pages.try_reserve_exact(nr_pages)?;
        pages.extend((0..nr_pages as u64).map(|i| Page::new_device(first_pfn + i, memory_type)));
        Ok(Self {
            first_pfn,
            pages: pages.into_boxed_slice(),
        })
    }

    #[must_use]
    pub const fn first_pfn(&self) -> Pfn {
        self.first_pfn
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn index_of(&self, pfn: Pfn) -> Option<usize> {
        let idx = pfn.checked_sub(self.first_pfn)?;
        let idx = usize::try_from(idx).ok()?;
        (idx < self.pages.len()).then_some(idx)
    }

    #[must_use]
    pub fn page(&self, pfn: Pfn) -> Option<&Page> {
        self.index_of(pfn).map(|i| &self.pages[i])
    }

    pub(crate) fn page_at(&self, idx: usize) -> &Page {
        &self.pages[idx]
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }
}

/// The page lives in device memory.
#[inline]
#[must_use]
pub const fn is_zone_device_page(page: &Page) -> bool {
    cfg!(feature = "zone-device") && matches!(page.zone, PageZone::Device(_))
}

#[cfg(feature = "pci-p2pdma")]
#[inline]
#[must_use]
pub const fn is_pci_p2pdma_page(page: &Page) -> bool {
    is_zone_device_page(page) && matches!(page.zone, PageZone::Device(MemoryType::PciP2pDma { .. }))
}

#[cfg(not(feature = "pci-p2pdma"))]
#[inline]
#[must_use]
pub const fn is_pci_p2pdma_page(_page: &Page) -> bool {
    false
}

#[cfg(feature = "device-private")]
#[inline]
#[must_use]
pub const fn is_device_private_page(page: &Page) -> bool {
    is_zone_device_page(page) && matches!(page.zone, PageZone::Device(MemoryType::Private))
}

#[cfg(not(feature = "device-private"))]
#[inline]
#[must_use]
pub const fn is_device_private_page(_page: &Page) -> bool {
    false
}

#[cfg(feature = "device-public")]
#[inline]
#[must_use]
pub const fn is_device_public_page(page: &Page) -> bool {
    is_zone_device_page(page) && matches!(page.zone, PageZone::Device(MemoryType::Public))
}

#[cfg(not(feature = "device-public"))]
#[inline]
#[must_use]
pub const fn is_device_public_page(_page: &Page) -> bool {
    false
}

/// Idle transitions of this page are reported to its driver.
#[inline]
#[must_use]
pub const fn is_devmap_managed_page(page: &Page) -> bool {
    is_device_private_page(page) || is_device_public_page(page)
}

/// Whether a long-term pin may be taken on the page.
#[inline]
#[must_use]
pub const fn page_is_pinnable(page: &Page) -> bool {
    match page.zone {
        PageZone::Normal => true,
        PageZone::Device(ty) => ty.is_pinnable(),
    }
}

/// The CPU can load from and store to the page directly.
#[inline]
#[must_use]
pub const fn page_is_cpu_addressable(page: &Page) -> bool {
    match page.zone {
        PageZone::Normal => true,
        PageZone::Device(ty) => ty.is_cpu_addressable(),
    }
}
