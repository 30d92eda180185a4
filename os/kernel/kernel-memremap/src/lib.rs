//! # Device Memory Regions
//!
//! Lets drivers hand ranges of device memory to the memory manager so that
//! they get per-page descriptors like ordinary RAM, and lets the rest of the
//! kernel find out, frame by frame, which region (if any) a page belongs to.
//!
//! ```text
//!  driver                          registry                     memory manager
//!    │ DevPagemap::builder(..)        │                                │
//!    │ devm_memremap_pages ─────────► │ insert [start, end)            │
//!    │                                │ ◄──────── get_dev_pagemap(pfn) │
//!    │                                │ ────────► PagemapRef ────────► │
//!    │ ◄────────── page_free(page) ── │ ◄──────── drop DevicePageRef   │
//!    │ ◄────────── page_fault(..) ─── │ ◄──── CPU fault on private page│
//!    │ memunmap_pages ──────────────► │ drain, remove, reclaim         │
//! ```
//!
//! ## Memory types
//!
//! [`MemoryType`] decides how pages are treated: [`Host`](MemoryType::Host)
//! memory behaves like RAM, [`Private`](MemoryType::Private) memory is not
//! CPU addressable and is migrated on fault, [`Public`](MemoryType::Public)
//! memory is coherent but never pinned, and
//! [`PciP2pDma`](MemoryType::PciP2pDma) memory is a PCI BAR used for
//! peer-to-peer DMA.
//!
//! ## Metadata placement
//!
//! Page descriptors are stored in the region's own [`VmemAltmap`] when one
//! is supplied, and otherwise come from the general [`FrameAlloc`].
//!
//! ## Lifetime
//!
//! Each region carries a [`RefGate`]. Lookups take live references;
//! teardown kills the gate, so new lookups fail while existing holders
//! finish, and completes once the last reference is gone.
//!
//! ## Configuration
//!
//! The `zone-device` feature builds device memory support at all;
//! `device-private`, `device-public` and `pci-p2pdma` add the individual
//! types. Without `zone-device`, registration fails with
//! [`MemremapError::Unsupported`] and lookups find nothing.
//!
//! [`FrameAlloc`]: kernel_alloc::FrameAlloc
//! [`RefGate`]: kernel_sync::RefGate

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod altmap;
mod device;
mod error;
mod fault;
mod memory_type;
mod memremap;
mod page;
mod pagemap;
mod registry;

pub use crate::altmap::{VmemAltmap, vmem_altmap_free, vmem_altmap_offset};
pub use crate::device::Device;
pub use crate::error::{MemremapError, TeardownError};
pub use crate::fault::{
    FaultFlags, PmdEntry, VmArea, VmFault, handle_device_private_fault, migrate_fault_window,
};
pub use crate::memory_type::MemoryType;
pub use crate::memremap::Memremap;
pub use crate::page::{
    DEVICE_PAGE_IDLE_REFCOUNT, Memmap, Page, PageZone, is_devmap_managed_page,
    is_device_private_page, is_device_public_page, is_pci_p2pdma_page, is_zone_device_page,
    page_is_cpu_addressable, page_is_pinnable,
};
pub use crate::pagemap::{
    DevPagemap, DevPagemapBuilder, PageFaultOps, PageFreeOps, PagemapData, PagemapError,
    PagemapState,
};
pub use crate::registry::{
    DevicePageRef, PagemapRef, PagemapRegistry, get_dev_pagemap, init_registry,
    put_dev_pagemap, registry,
};
