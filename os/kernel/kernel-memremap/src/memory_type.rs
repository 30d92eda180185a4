//! The behavioural variants of device memory.

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// What kind of device memory a region holds, and therefore how the rest of
/// the memory manager must treat its pages.
///
/// | Variant | CPU addressable | Pinnable | CPU fault migrates |
/// |---------|-----------------|----------|--------------------|
/// | [`Host`](Self::Host) | yes | yes | no |
/// | [`Private`](Self::Private) | no | no | yes |
/// | [`Public`](Self::Public) | yes (coherent) | **no** | no |
/// | [`PciP2pDma`](Self::PciP2pDma) | yes | yes | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Persistent or otherwise CPU-visible device memory that behaves like
    /// ordinary RAM with different bandwidth and latency.
    Host,
    /// Device memory the CPU can neither read nor write. A CPU access faults
    /// and the region's fault handler migrates the data to system memory.
    Private,
    /// Cache-coherent device memory. Anything may be migrated into it, but
    /// nothing may pin it, so it can always be evicted back.
    Public,
    /// Memory inside a PCI BAR meant for peer-to-peer DMA between devices.
    ///
    /// `bus_offset` translates a CPU physical address into the address a
    /// peer device has to use on the bus.
    PciP2pDma { bus_offset: u64 },
}

impl MemoryType {
    #[must_use]
    pub const fn is_cpu_addressable(self) -> bool {
        !matches!(self, Self::Private)
    }

    /// Whether a long-term pin may be taken on a page of this type.
    #[must_use]
    pub const fn is_pinnable(self) -> bool {
        matches!(self, Self::Host | Self::PciP2pDma { .. })
    }

    /// A CPU fault on this memory must be resolved by migrating the page.
    #[must_use]
    pub const fn requires_fault_migration(self) -> bool {
        matches!(self, Self::Private)
    }

    /// Pages whose idle transition is reported to the owning driver instead
    /// of going back to the page allocator.
    #[must_use]
    pub const fn is_devmap_managed(self) -> bool {
        matches!(self, Self::Private | Self::Public)
    }

    /// The bus offset of a peer-to-peer region; zero for every other type.
    #[must_use]
    pub const fn bus_offset(self) -> u64 {
        match self {
            Self::PciP2pDma { bus_offset } => bus_offset,
            _ => 0,
        }
    }

    /// Bus address a peer device must use to reach `pa`.
    ///
    /// `None` for non peer-to-peer memory or if the translation overflows.
    #[must_use]
    pub const fn bus_address(self, pa: PhysicalAddress) -> Option<u64> {
        match self {
            Self::PciP2pDma { bus_offset } => pa.as_u64().checked_add(bus_offset),
            _ => None,
        }
    }

    /// Whether support for this type was compiled in.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        match self {
            Self::Host => cfg!(feature = "zone-device"),
            Self::Private => cfg!(feature = "device-private"),
            Self::Public => cfg!(feature = "device-public"),
            Self::PciP2pDma { .. } => cfg!(feature = "pci-p2pdma"),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Private => "private",
            Self::Public => "public",
            Self::PciP2pDma { .. } => "pci-p2pdma",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MemoryType; 4] = [
        MemoryType::Host,
        MemoryType::Private,
        MemoryType::Public,
        MemoryType::PciP2pDma { bus_offset: 0x1000 },
    ];

    #[test]
    fn only_private_memory_migrates_on_fault() {
        for ty in ALL {
            assert_eq!(ty.requires_fault_migration(), !ty.is_cpu_addressable(), "{ty}");
        }
    }

    #[test]
    fn public_memory_is_never_pinnable() {
        assert!(!MemoryType::Public.is_pinnable());
        assert!(MemoryType::Host.is_pinnable());
    }

    #[test]
    fn bus_offset_only_for_p2p() {
        let pa = PhysicalAddress::new(0x8000_0000);
        assert_eq!(ALL[3].bus_address(pa), Some(0x8000_1000));
        for ty in &ALL[..3] {
            assert_eq!(ty.bus_offset(), 0);
            assert_eq!(ty.bus_address(pa), None);
        }
        let wrap = MemoryType::PciP2pDma { bus_offset: u64::MAX };
        assert_eq!(wrap.bus_address(pa), None);
    }
}
