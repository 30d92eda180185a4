//! # Platform Memory Configuration
//!
//! Compile-time constants shared by the memory management crates. This is
//! the single place where the platform's physical address width, the direct
//! map placement and the size of per-page metadata are defined, so that the
//! allocator, the direct-map translator and the device memory registry can
//! not drift apart.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//!                       │ (RAM and device memory aliases) │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All values are `const`; the `const _` block in [`memory`] rejects
//! inconsistent combinations at build time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
