//! Frame → region lookup.
//!
//! The registry maps the first frame of every registered region to the
//! region and its page descriptors. Regions never overlap, so the entry for
//! a frame is the last one starting at or below it, provided it also ends
//! above it. A whole region becomes visible with one insert; there is no
//! state in which part of a range resolves and part does not.
//!
//! Lookups hand out [`PagemapRef`]s. A reference can only be taken while the
//! region's [`RefGate`](kernel_sync::RefGate) is live, so once teardown has
//! started a region looks absent to new lookups while existing holders keep
//! working and release normally.

use crate::error::MemremapError;
use crate::pagemap::DevPagemap;
use crate::page::{Memmap, Page};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use kernel_memory_addresses::{Pfn, PhysicalAddress, PhysicalRange, VirtualAddress};
use kernel_sync::{RwSpinLock, SyncOnceCell};

/// Where a region's page descriptors are stored.
#[derive(Debug)]
pub(crate) enum MemmapBacking {
    /// Inside the region's altmap. `align` pages of padding precede them.
    Altmap { nr: u64, align: u64 },
    /// Frames taken from the general allocator.
    Frames(Vec<PhysicalAddress>),
}

impl MemmapBacking {
    pub(crate) fn nr_pages(&self) -> u64 {
        match self {
            Self::Altmap { nr, .. } => *nr,
            Self::Frames(frames) => frames.len() as u64,
        }
    }
}

/// A registered region together with its page descriptors.
#[derive(Debug)]
pub(crate) struct Mapping {
    pub(crate) pgmap: Arc<DevPagemap>,
    pub(crate) memmap: Memmap,
    pub(crate) base: VirtualAddress,
    pub(crate) backing: MemmapBacking,
}

/// All registered device memory regions, keyed by first frame.
pub struct PagemapRegistry {
    map: RwSpinLock<BTreeMap<u64, Arc<Mapping>>>,
}

impl Default for PagemapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PagemapRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            map: RwSpinLock::new(BTreeMap::new()),
        }
    }

    /// Number of regions currently registered (active or draining).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// The registered range overlapping `res`, if any.
    #[must_use]
    pub fn conflicting(&self, res: &PhysicalRange) -> Option<PhysicalRange> {
        Self::conflict_in(&self.map.read(), res)
    }

    fn conflict_in(map: &BTreeMap<u64, Arc<Mapping>>, res: &PhysicalRange) -> Option<PhysicalRange> {
        // Entries never overlap each other, so only the last one starting
        // below `res`'s end can reach into it.
        let (_, m) = map.range(..res.end_pfn().as_u64()).next_back()?;
        let existing = m.pgmap.range();
        existing.overlaps(res).then_some(existing)
    }

    /// Make `mapping` visible. Fails with the overlapping range.
    pub(crate) fn insert(&self, mapping: Arc<Mapping>) -> Result<(), PhysicalRange> {
        let res = mapping.pgmap.range();
        let mut map = self.map.write();
        if let Some(existing) = Self::conflict_in(&map, &res) {
            return Err(existing);
        }
        map.insert(res.start_pfn().as_u64(), mapping);
        Ok(())
    }

    /// `pgmap` is registered here, whether active or draining.
    pub(crate) fn contains(&self, pgmap: &Arc<DevPagemap>) -> bool {
        let key = pgmap.range().start_pfn().as_u64();
        self.map
            .read()
            .get(&key)
            .is_some_and(|m| Arc::ptr_eq(&m.pgmap, pgmap))
    }

    pub(crate) fn remove(&self, pgmap: &Arc<DevPagemap>) -> Option<Arc<Mapping>> {
        let key = pgmap.range().start_pfn().as_u64();
        let mut map = self.map.write();
        if !map.get(&key).is_some_and(|m| Arc::ptr_eq(&m.pgmap, pgmap)) {
            return None;
        }
        map.remove(&key)
    }

    /// Find the live region containing `pfn`.
    ///
    /// If `hint` already covers `pfn` it is returned unchanged, so walking a
    /// range frame by frame costs one lookup per region. Otherwise the hint
    /// is released before searching. Regions that are being torn down are
    /// not found.
    #[must_use]
    pub fn get_dev_pagemap(&self, pfn: Pfn, hint: Option<PagemapRef>) -> Option<PagemapRef> {
        if let Some(hint) = hint {
            if hint.covers(pfn) {
                return Some(hint);
            }
            drop(hint);
        }
        if !cfg!(feature = "zone-device") {
            return None;
        }

        // Taking the reference under the read lock pins the entry found to
        // the registration that is live right now.
        let map = self.map.read();
        let (_, mapping) = map.range(..=pfn.as_u64()).next_back()?;
        if !mapping.pgmap.range().contains_pfn(pfn) {
            log::trace!("memremap: {pfn:?} is not device memory");
            return None;
        }
        if !mapping.pgmap.gate().try_get_live() {
            log::trace!("memremap: {pfn:?} belongs to a draining region");
            return None;
        }
        Some(PagemapRef {
            mapping: Arc::clone(mapping),
        })
    }

    /// Look up `pfn` and take a reference on its page descriptor.
    ///
    /// Frames of the altmap carve-out belong to the region but have no
    /// descriptor; they are not found here.
    #[must_use]
    pub fn get_dev_page(&self, pfn: Pfn) -> Option<DevicePageRef> {
        let pgmap = self.get_dev_pagemap(pfn, None)?;
        let index = pgmap.mapping.memmap.index_of(pfn)?;
        pgmap.mapping.memmap.page_at(index).get();
        Some(DevicePageRef { pgmap, index })
    }
}

impl fmt::Debug for PagemapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.map.read();
        f.debug_list()
            .entries(map.values().map(|m| m.pgmap.range()))
            .finish()
    }
}

/// A counted reference on a registered region.
///
/// While any `PagemapRef` exists the region can not finish teardown. Dropping
/// it (or passing it to [`put_dev_pagemap`]) releases the reference.
pub struct PagemapRef {
    mapping: Arc<Mapping>,
}

impl PagemapRef {
    #[must_use]
    pub fn pagemap(&self) -> &Arc<DevPagemap> {
        &self.mapping.pgmap
    }

    /// Whether `pfn` lies inside this region.
    #[must_use]
    pub fn covers(&self, pfn: Pfn) -> bool {
        self.mapping.pgmap.range().contains_pfn(pfn)
    }

    /// The descriptor of `pfn`, if it is a device page of this region.
    #[must_use]
    pub fn page(&self, pfn: Pfn) -> Option<&Page> {
        self.mapping.memmap.page(pfn)
    }

    #[must_use]
    pub fn memmap(&self) -> &Memmap {
        &self.mapping.memmap
    }

    /// Kernel virtual address of the start of the region.
    #[must_use]
    pub fn base_address(&self) -> VirtualAddress {
        self.mapping.base
    }

    /// Kernel virtual address of `pa`, if it lies inside the region.
    #[must_use]
    pub fn virt_addr(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let res = self.mapping.pgmap.range();
        res.contains(pa)
            .then(|| self.mapping.base + (pa.as_u64() - res.start().as_u64()))
    }
}

impl Deref for PagemapRef {
    type Target = DevPagemap;

    fn deref(&self) -> &DevPagemap {
        &self.mapping.pgmap
    }
}

impl Clone for PagemapRef {
    fn clone(&self) -> Self {
        self.mapping.pgmap.gate().get();
        Self {
            mapping: Arc::clone(&self.mapping),
        }
    }
}

impl Drop for PagemapRef {
    fn drop(&mut self) {
        self.mapping.pgmap.put_ref();
    }
}

impl fmt::Debug for PagemapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PagemapRef")
            .field(&self.mapping.pgmap.range())
            .finish()
    }
}

/// A counted reference on one device page, and through it on its region.
///
/// When the last user drops its reference and the page falls back to its
/// idle count, the region's free callback runs with the region's data.
pub struct DevicePageRef {
    pgmap: PagemapRef,
    index: usize,
}

impl DevicePageRef {
    #[must_use]
    pub fn page(&self) -> &Page {
        self.pgmap.mapping.memmap.page_at(self.index)
    }

    #[must_use]
    pub const fn pagemap(&self) -> &PagemapRef {
        &self.pgmap
    }
}

impl Clone for DevicePageRef {
    fn clone(&self) -> Self {
        self.page().get();
        Self {
            pgmap: self.pgmap.clone(),
            index: self.index,
        }
    }
}

impl Drop for DevicePageRef {
    fn drop(&mut self) {
        let page = self.page();
        if page.put() {
            self.pgmap.free_page(page);
        }
    }
}

impl fmt::Debug for DevicePageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DevicePageRef").field(self.page()).finish()
    }
}

/// Release a reference from [`get_dev_pagemap`]. `None` is a no-op.
pub fn put_dev_pagemap(pgmap: Option<PagemapRef>) {
    drop(pgmap);
}

static REGISTRY: SyncOnceCell<PagemapRegistry> = SyncOnceCell::new();

/// Create the global registry.
///
/// # Errors
/// [`MemremapError::AlreadyInitialized`] on every call after the first.
pub fn init_registry() -> Result<&'static PagemapRegistry, MemremapError> {
    REGISTRY
        .set(PagemapRegistry::new())
        .map_err(|_| MemremapError::AlreadyInitialized)
}

/// The global registry, once [`init_registry`] ran.
#[must_use]
pub fn registry() -> Option<&'static PagemapRegistry> {
    REGISTRY.get()
}

/// [`PagemapRegistry::get_dev_pagemap`] on the global registry.
///
/// Finds nothing before [`init_registry`] or without device memory support.
#[must_use]
pub fn get_dev_pagemap(pfn: Pfn, hint: Option<PagemapRef>) -> Option<PagemapRef> {
    registry()?.get_dev_pagemap(pfn, hint)
}
