//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Number of physical address bits the platform can decode (x86-64 MAXPHYADDR).
pub const MAX_PHYSICAL_ADDRESS_BITS: u32 = 52;

/// Bytes of physical memory the direct map at [`HHDM_BASE`] covers
/// (64 TiB, the 4-level paging layout).
pub const DIRECT_MAP_SIZE: u64 = 1 << 46;

/// One past the highest physical address the kernel can reach: the smaller
/// of what the CPU decodes and what the direct map covers.
pub const MAX_PHYSICAL_ADDRESS: u64 = {
    let decodable = 1 << MAX_PHYSICAL_ADDRESS_BITS;
    if decodable < DIRECT_MAP_SIZE {
        decodable
    } else {
        DIRECT_MAP_SIZE
    }
};

/// Size in bytes of one per-page descriptor in the memory map.
pub const PAGE_STRUCT_SIZE: u64 = 64;

/// Number of per-page descriptors that fit into one page of metadata.
pub const PAGE_STRUCTS_PER_PAGE: u64 = PAGE_SIZE / PAGE_STRUCT_SIZE;

/// Pages of metadata needed to describe `nr_pages` pages.
#[must_use]
pub const fn memmap_pages(nr_pages: u64) -> u64 {
    nr_pages.div_ceil(PAGE_STRUCTS_PER_PAGE)
}

const _: () = {
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(PAGE_SIZE.is_multiple_of(PAGE_STRUCT_SIZE));
    // Every reachable physical address has a direct-map alias.
    assert!(HHDM_BASE.checked_add(MAX_PHYSICAL_ADDRESS - 1).is_some());
};
