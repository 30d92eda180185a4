//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the address units used when device memory is
//! described as page-granular memory.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory or a device BAR. |
//! | [`VirtualAddress`] | A byte address in the kernel's (translated) address space. |
//! | [`Pfn`] | A page frame number, i.e. a physical address shifted by [`PAGE_SHIFT`]. |
//! | [`PhysicalRange`] | A half-open `[start, end)` physical byte range owned by a device. |
//!
//! All types are `#[repr(transparent)]` (or plain pairs of those) and zero-cost
//! wrappers around `u64` values. Keeping frame numbers and byte addresses in
//! different types makes the classic "passed a pfn where an address was
//! expected" bug a compile error.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = PhysicalRange::new(PhysicalAddress::new(0x1000), 0x1000);
//! assert_eq!(range.start_pfn(), Pfn::new(1));
//! assert_eq!(range.end_pfn(), Pfn::new(2));
//! assert!(range.contains_pfn(PhysicalAddress::new(0x1800).pfn()));
//! assert_eq!(range.nr_pages(), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod pfn;
mod physical_address;
mod physical_range;
mod virtual_address;

pub use pfn::Pfn;
pub use physical_address::PhysicalAddress;
pub use physical_range::PhysicalRange;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits of an address.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Returns `true` if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}
