//! # Direct-map translators
//!
//! [`PhysMapper`] implementations used to find the kernel virtual alias of a
//! physical address.
//!
//! - [`HhdmPhysMapper`]: every physical address `pa` below
//!   `MAX_PHYSICAL_ADDRESS` is mapped at `HHDM_BASE + pa`, the kernel's
//!   normal configuration.
//! - [`OffsetPhysMapper`]: the same with a caller-chosen offset (an offset of
//!   zero is an identity map), handy for loaders and tests.
//!
//! Neither touches page tables. They assume the direct map already covers
//! the range; populating it is the hotplug path's job.

use crate::PhysMapper;
use kernel_info::memory::{HHDM_BASE, MAX_PHYSICAL_ADDRESS};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] implementation for kernels with a higher-half direct map (HHDM).
///
/// # Example
/// ```rust
/// use kernel_alloc::{PhysMapper, phys_mapper::HhdmPhysMapper};
/// use kernel_memory_addresses::PhysicalAddress;
///
/// let va = HhdmPhysMapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
/// assert_eq!(va.map(|va| va.as_u64()), Some(kernel_info::memory::HHDM_BASE + 0x1234_0000));
///
/// let beyond = PhysicalAddress::new(kernel_info::memory::MAX_PHYSICAL_ADDRESS);
/// assert!(HhdmPhysMapper.phys_to_virt(beyond).is_none());
/// ```
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        (pa.as_u64() < MAX_PHYSICAL_ADDRESS).then(|| VirtualAddress::new(HHDM_BASE + pa.as_u64()))
    }
}

/// [`PhysMapper`] with an arbitrary constant offset.
#[derive(Debug, Default, Copy, Clone)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }
}

impl PhysMapper for OffsetPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.offset.checked_add(pa.as_u64()).map(VirtualAddress::new)
    }
}
