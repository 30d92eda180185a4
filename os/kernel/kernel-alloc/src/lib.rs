//! # Physical Frame Allocation and Direct-Map Translation
//!
//! This crate provides the two collaborators every consumer of raw physical
//! memory needs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Physical Mapper                     │
//! │    • Physical-to-virtual address translation        │
//! │    • HHDM (Higher Half Direct Mapping)              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • 4KiB page frame management                     │
//! │    • Bitmap-based free/used tracking                │
//! │    • No-heap allocation strategy                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Physical Frame Allocator ([`frame_alloc`])
//!
//! The general-purpose source of 4 KiB frames. Subsystems that must not
//! recurse into it (for example while describing memory that is about to be
//! handed to it) take the [`FrameAlloc`] trait by `&mut` so that callers can
//! plug in a restricted or failing implementation such as
//! [`NoFrameAlloc`](frame_alloc::NoFrameAlloc).
//!
//! ## Physical Mapper ([`phys_mapper`])
//!
//! Translates a physical address into the kernel virtual address under which
//! it is reachable. With an HHDM every physical address `pa` below
//! `MAX_PHYSICAL_ADDRESS` lives at `HHDM_BASE + pa`; anything above has no
//! alias.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::{FrameAlloc, PhysMapper};
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut frames = BitmapFrameAlloc::<1>::new(PhysicalAddress::new(0x10_0000), 8);
//! let pa = frames.alloc_4k().unwrap();
//! let va = HhdmPhysMapper.phys_to_virt(pa).unwrap();
//! assert_eq!(va.as_u64() - pa.as_u64(), kernel_info::memory::HHDM_BASE);
//! frames.free_4k(pa);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

pub mod frame_alloc;
pub mod phys_mapper;

/// Source of 4 KiB physical frames.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, pa: PhysicalAddress);
}

/// Translates physical addresses into the virtual addresses that alias them.
pub trait PhysMapper {
    /// The alias of `pa`, or `None` if the mapping does not reach it.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}
