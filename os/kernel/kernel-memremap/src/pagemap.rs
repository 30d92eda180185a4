//! The region descriptor a driver hands to [`devm_memremap_pages`].
//!
//! A [`DevPagemap`] describes one contiguous range of device memory: what
//! kind of memory it is, how its metadata is stored, and which driver
//! callbacks handle its pages. The driver owns the descriptor through an
//! [`Arc`]; registration only borrows a clone for as long as the range is
//! visible in the registry.
//!
//! ```text
//! Unregistered ──register──► Active ──teardown──► Draining ──quiescent──► Reclaimed
//!                               ▲                                             │
//!                               └───────────────── register ──────────────────┘
//! ```
//!
//! [`devm_memremap_pages`]: crate::Memremap::devm_memremap_pages

use crate::altmap::VmemAltmap;
use crate::device::{Device, DeviceInner};
use crate::fault::{FaultFlags, PmdEntry, VmArea, VmFault};
use crate::memory_type::MemoryType;
use crate::page::Page;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_memory_addresses::{Pfn, PhysicalRange, VirtualAddress};
use kernel_sync::{RefGate, RwSpinLock};

/// Driver data threaded through to the free callback.
pub type PagemapData = dyn Any + Send + Sync;

/// Called when a device page falls back to its idle reference count.
///
/// The page is no longer used by anyone but the driver; this is where the
/// driver recycles it. Runs in whatever context dropped the last reference
/// and must not block.
pub trait PageFreeOps: Send + Sync {
    fn page_free(&self, page: &Page, data: Option<&PagemapData>);
}

impl<F> PageFreeOps for F
where
    F: Fn(&Page, Option<&PagemapData>) + Send + Sync,
{
    fn page_free(&self, page: &Page, data: Option<&PagemapData>) {
        self(page, data);
    }
}

/// Resolves a CPU fault on a [`Private`](MemoryType::Private) page.
///
/// Implementations migrate at least the page backing `address` into system
/// memory and point `pmd` at the replacement before returning `Ok`. If other
/// pages are migrated opportunistically the faulting one must come first;
/// [`migrate_fault_window`](crate::migrate_fault_window) does that ordering.
pub trait PageFaultOps: Send + Sync {
    /// # Errors
    /// [`VmFault::SigBus`] if the device can not serve the page,
    /// [`VmFault::Oom`] if no system page could be allocated.
    fn page_fault(
        &self,
        vma: &VmArea,
        address: VirtualAddress,
        page: &Page,
        flags: FaultFlags,
        pmd: &mut PmdEntry,
    ) -> Result<(), VmFault>;
}

impl<F> PageFaultOps for F
where
    F: Fn(&VmArea, VirtualAddress, &Page, FaultFlags, &mut PmdEntry) -> Result<(), VmFault>
        + Send
        + Sync,
{
    fn page_fault(
        &self,
        vma: &VmArea,
        address: VirtualAddress,
        page: &Page,
        flags: FaultFlags,
        pmd: &mut PmdEntry,
    ) -> Result<(), VmFault> {
        self(vma, address, page, flags, pmd)
    }
}

/// Registration lifecycle of a [`DevPagemap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PagemapState {
    /// Described but never registered.
    Unregistered = 0,
    /// Visible to lookups.
    Active = 1,
    /// Teardown started; lookups fail, holders are still releasing.
    Draining = 2,
    /// Every reference is gone and the metadata was returned.
    Reclaimed = 3,
}

impl PagemapState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unregistered,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Reclaimed,
        }
    }
}

impl fmt::Display for PagemapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unregistered => "unregistered",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Reclaimed => "reclaimed",
        })
    }
}

/// Why a descriptor is not fit for registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PagemapError {
    #[error("private device memory requires a fault handler")]
    MissingFaultHandler,
    #[error("{0} device memory must not have a fault handler")]
    UnexpectedFaultHandler(MemoryType),
    #[error("altmap base {base} is not the first frame of the range ({start})")]
    AltmapBaseMismatch { base: Pfn, start: Pfn },
    #[error("altmap carve-out of {carve_out} pages leaves no device pages out of {nr_pages}")]
    AltmapTooLarge { carve_out: u64, nr_pages: u64 },
}

/// Descriptor of one device memory region.
pub struct DevPagemap {
    res: PhysicalRange,
    memory_type: MemoryType,
    page_free: Arc<dyn PageFreeOps>,
    page_fault: Option<Arc<dyn PageFaultOps>>,
    altmap: RwSpinLock<VmemAltmap>,
    altmap_valid: bool,
    gate: RefGate,
    owner: RwSpinLock<Option<Weak<DeviceInner>>>,
    data: Option<Arc<PagemapData>>,
    state: AtomicU8,
}

/// Builder for [`DevPagemap`].
///
/// # Example
/// ```rust
/// use kernel_memremap::{DevPagemap, MemoryType, Page, PagemapData, PagemapState};
/// use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
///
/// let res = PhysicalRange::new(PhysicalAddress::new(0x1000_0000), 0x10_0000);
/// let pgmap = DevPagemap::builder(res, MemoryType::Host, |_: &Page, _: Option<&PagemapData>| {})
///     .data(42u32)
///     .build();
/// assert_eq!(pgmap.state(), PagemapState::Unregistered);
/// assert!(pgmap.validate().is_ok());
/// ```
#[must_use]
pub struct DevPagemapBuilder {
    res: PhysicalRange,
    memory_type: MemoryType,
    page_free: Arc<dyn PageFreeOps>,
    page_fault: Option<Arc<dyn PageFaultOps>>,
    altmap: VmemAltmap,
    altmap_valid: bool,
    data: Option<Arc<PagemapData>>,
}

impl DevPagemapBuilder {
    pub fn page_fault(mut self, ops: impl PageFaultOps + 'static) -> Self {
        self.page_fault = Some(Arc::new(ops));
        self
    }

    /// Store the region's metadata in `altmap`.
    pub const fn altmap(self, altmap: VmemAltmap) -> Self {
        self.raw_altmap(altmap, true)
    }

    /// Set the altmap and its validity flag independently.
    ///
    /// An altmap that is not marked valid is never consulted, whatever its
    /// fields contain.
    pub const fn raw_altmap(mut self, altmap: VmemAltmap, valid: bool) -> Self {
        self.altmap = altmap;
        self.altmap_valid = valid;
        self
    }

    pub fn data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<DevPagemap> {
        Arc::new(DevPagemap {
            res: self.res,
            memory_type: self.memory_type,
            page_free: self.page_free,
            page_fault: self.page_fault,
            altmap: RwSpinLock::new(self.altmap),
            altmap_valid: self.altmap_valid,
            gate: RefGate::new_quiescent(),
            owner: RwSpinLock::new(None),
            data: self.data,
            state: AtomicU8::new(PagemapState::Unregistered as u8),
        })
    }
}

impl DevPagemap {
    /// Start describing the region `res` of type `memory_type`.
    pub fn builder(
        res: PhysicalRange,
        memory_type: MemoryType,
        page_free: impl PageFreeOps + 'static,
    ) -> DevPagemapBuilder {
        DevPagemapBuilder {
            res,
            memory_type,
            page_free: Arc::new(page_free),
            page_fault: None,
            altmap: VmemAltmap::default(),
            altmap_valid: false,
            data: None,
        }
    }

    /// Check the type specific invariants of the descriptor.
    ///
    /// # Errors
    /// The first violated invariant.
    pub fn validate(&self) -> Result<(), PagemapError> {
        match (self.memory_type, self.page_fault.is_some()) {
            (MemoryType::Private, false) => return Err(PagemapError::MissingFaultHandler),
            (ty, true) if !ty.requires_fault_migration() => {
                return Err(PagemapError::UnexpectedFaultHandler(ty));
            }
            _ => {}
        }

        if self.altmap_valid {
            let altmap = *self.altmap.read();
            let start = self.res.start_pfn();
            if altmap.base_pfn() != start {
                return Err(PagemapError::AltmapBaseMismatch {
                    base: altmap.base_pfn(),
                    start,
                });
            }
            let nr_pages = self.res.nr_pages();
            let carve_out = altmap.carve_out().unwrap_or(u64::MAX);
            if carve_out >= nr_pages {
                return Err(PagemapError::AltmapTooLarge {
                    carve_out,
                    nr_pages,
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        self.res
    }

    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    #[must_use]
    pub const fn altmap_valid(&self) -> bool {
        self.altmap_valid
    }

    /// A snapshot of the altmap, if one was supplied.
    #[must_use]
    pub fn altmap(&self) -> Option<VmemAltmap> {
        self.altmap_valid.then(|| *self.altmap.read())
    }

    /// First frame that gets a page descriptor.
    ///
    /// An altmap that does not fit the range leaves no device pages, so this
    /// is then [`pfn_end`](Self::pfn_end).
    #[must_use]
    pub fn pfn_first(&self) -> Pfn {
        if self.altmap_valid {
            let end = self.pfn_end();
            self.altmap
                .read()
                .first_device_pfn()
                .map_or(end, |pfn| pfn.min(end))
        } else {
            self.res.start_pfn()
        }
    }

    /// One past the last frame of the region.
    #[must_use]
    pub const fn pfn_end(&self) -> Pfn {
        self.res.end_pfn()
    }

    #[must_use]
    pub const fn pci_p2pdma_bus_offset(&self) -> u64 {
        self.memory_type.bus_offset()
    }

    #[must_use]
    pub fn data(&self) -> Option<&PagemapData> {
        self.data.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> PagemapState {
        PagemapState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The device the region is registered for, while it is.
    #[must_use]
    pub fn owner(&self) -> Option<Device> {
        self.owner.read().as_ref().and_then(Device::from_weak)
    }

    /// Outstanding references on the region, the registration's own
    /// reference included while active.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.gate.count()
    }

    pub(crate) const fn gate(&self) -> &RefGate {
        &self.gate
    }

    pub(crate) fn page_fault_ops(&self) -> Option<&dyn PageFaultOps> {
        self.page_fault.as_deref()
    }

    pub(crate) fn free_page(&self, page: &Page) {
        self.page_free.page_free(page, self.data());
    }

    pub(crate) fn commit_altmap(&self, altmap: VmemAltmap) {
        *self.altmap.write() = altmap;
    }

    pub(crate) fn with_altmap<R>(&self, f: impl FnOnce(&mut VmemAltmap) -> R) -> R {
        self.altmap.with_write(f)
    }

    pub(crate) fn set_owner(&self, owner: Option<&Device>) {
        *self.owner.write() = owner.map(Device::downgrade);
    }

    /// Move from `from` to `to`; on failure returns the state found.
    pub(crate) fn transition(&self, from: PagemapState, to: PagemapState) -> Result<(), PagemapState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PagemapState::from_u8)
    }

    pub(crate) fn set_state(&self, state: PagemapState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Drop one region reference.
    pub(crate) fn put_ref(&self) {
        if self.gate.put() {
            log::debug!("memremap: {} {} quiescent", self.memory_type, self.res);
        }
    }
}

impl fmt::Debug for DevPagemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevPagemap")
            .field("res", &self.res)
            .field("type", &self.memory_type)
            .field("state", &self.state())
            .field("altmap", &self.altmap())
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
