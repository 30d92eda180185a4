//! CPU fault dispatch for device private memory.
//!
//! A CPU access to a [`Private`](crate::MemoryType::Private) page can not be
//! satisfied in place. The fault handler passes in the page reference its
//! page table entry holds and asks the owning region's
//! [`PageFaultOps`](crate::PageFaultOps) to migrate the data into system
//! memory and install a replacement mapping.
//!
//! The callback reports exactly one of three outcomes:
//!
//! | Outcome | Meaning | Caller reaction |
//! |---------|---------|-----------------|
//! | `Ok(())` | data migrated, mapping installed | retry the access |
//! | [`VmFault::SigBus`] | device/region unusable | deliver a bus error |
//! | [`VmFault::Oom`] | no system page to migrate into | reclaim and retry |
//!
//! There is no cancellation; whatever the callback returns is final for that
//! fault.

use crate::page::is_device_private_page;
use crate::registry::DevicePageRef;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{Pfn, VirtualAddress};

/// Why a device fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmFault {
    /// The device or region is unusable; the access gets a bus error.
    #[error("bus error: device memory is unusable")]
    SigBus,
    /// Migration failed for lack of system memory.
    #[error("out of memory while migrating device page")]
    Oom,
}

impl VmFault {
    /// Whether reclaiming memory and retrying may resolve the fault.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Oom)
    }
}

/// Fault flags, bit-compatible with the classic `FAULT_FLAG_*` layout.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FaultFlags {
    /// Bit 0 — the access was a write.
    pub write: bool,
    /// Bit 1 — mkwrite of an existing pte.
    pub mkwrite: bool,
    /// Bit 2 — the handler may drop the mmap lock and ask for a retry.
    pub allow_retry: bool,
    /// Bit 3 — do not wait when a retry is requested.
    pub retry_nowait: bool,
    /// Bit 4 — the fault task is in a killable region.
    pub killable: bool,
    /// Bit 5 — second attempt after a retry.
    pub tried: bool,
    /// Bit 6 — the fault originated in user mode.
    pub user: bool,
    /// Bit 7 — the fault is on behalf of another address space.
    pub remote: bool,
    /// Bit 8 — instruction fetch.
    pub instruction: bool,

    /// Bits 9–31 — Reserved.
    #[bits(23, default = 0)]
    _reserved_9_31: u32,
}

/// The page-middle-directory entry covering a faulting address.
///
/// Only the fields the migration contract needs are modelled: the fault
/// handler installs a replacement mapping (`present`, `pfn`) or poisons the
/// entry so later accesses fail fast.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PmdEntry {
    /// Bit 0 — Present.
    pub present: bool,
    /// Bit 1 — Writable.
    pub writable: bool,
    /// Bit 2 — User accessible.
    pub user: bool,

    /// Bits 3–8 — caching and accounting bits, unused here.
    #[bits(6, default = 0)]
    _reserved_3_8: u8,

    /// Bit 9 — Software: entry poisoned after a failed migration.
    pub poisoned: bool,

    /// Bits 10–11 — Software available.
    #[bits(2, default = 0)]
    _avail_10_11: u8,

    /// Bits 12–51 — Frame number of the mapped page.
    #[bits(40)]
    pub pfn: u64,

    /// Bits 52–63 — Reserved / NX, unused here.
    #[bits(12, default = 0)]
    _reserved_52_63: u16,
}

impl PmdEntry {
    /// A present mapping of `pfn`.
    #[must_use]
    pub fn mapping(pfn: Pfn, writable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_pfn(pfn.as_u64())
    }

    #[must_use]
    pub fn mapped_pfn(&self) -> Option<Pfn> {
        self.present().then(|| Pfn::new(self.pfn()))
    }

    /// Make every later access through this entry fail.
    pub fn poison(&mut self) {
        *self = Self::new().with_poisoned(true);
    }
}

/// The virtual memory area a fault occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmArea {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl VmArea {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }
}

/// Resolve a CPU fault on a device private page.
///
/// `mapped` is the reference the faulting page table entry holds on the
/// page. The fault path borrows it and never releases it, so a failed
/// migration can not hand a still mapped page back to its driver. After a
/// successful migration the caller drops `mapped` once the replacement
/// mapping is installed; that is what returns the device page to idle and
/// runs the region's free callback.
///
/// A page that is not private device memory, or whose region has no fault
/// callback, yields [`VmFault::SigBus`]. A bus error leaves `pmd` poisoned
/// even if the callback forgot to.
///
/// # Errors
/// The callback's outcome, unchanged.
pub fn handle_device_private_fault(
    vma: &VmArea,
    address: VirtualAddress,
    mapped: &DevicePageRef,
    flags: FaultFlags,
    pmd: &mut PmdEntry,
) -> Result<(), VmFault> {
    let page = mapped.page();
    let pfn = page.pfn();
    if !is_device_private_page(page) {
        log::warn!("memremap: fault at {address} on non-private device page {pfn:?}");
        pmd.poison();
        return Err(VmFault::SigBus);
    }
    let Some(ops) = mapped.pagemap().page_fault_ops() else {
        pmd.poison();
        return Err(VmFault::SigBus);
    };

    let result = ops.page_fault(vma, address, page, flags, pmd);
    match result {
        Ok(()) => log::trace!("memremap: fault at {address} migrated {pfn:?}"),
        Err(VmFault::SigBus) => pmd.poison(),
        Err(VmFault::Oom) => {
            log::debug!("memremap: fault at {address}: migration out of memory");
        }
    }
    result
}

/// Migrate the faulting page and, opportunistically, some neighbours.
///
/// `migrate` runs on the page containing `fault_address` first. If that fails
/// the whole call fails with its error and no neighbour is touched.
/// Neighbours are best effort: the first failing neighbour ends the batch
/// without failing the fault. Duplicates of the faulting page are skipped.
///
/// Returns the number of pages migrated.
///
/// # Errors
/// The error of the faulting page's migration.
pub fn migrate_fault_window<I, F>(
    fault_address: VirtualAddress,
    neighbours: I,
    mut migrate: F,
) -> Result<usize, VmFault>
where
    I: IntoIterator<Item = VirtualAddress>,
    F: FnMut(VirtualAddress) -> Result<(), VmFault>,
{
    let fault_page = fault_address.align_down();
    migrate(fault_page)?;

    let mut migrated = 1;
    for addr in neighbours {
        let addr = addr.align_down();
        if addr == fault_page {
            continue;
        }
        if let Err(e) = migrate(addr) {
            log::debug!("memremap: neighbour {addr} not migrated: {e}");
            break;
        }
        migrated += 1;
    }
    Ok(migrated)
}
