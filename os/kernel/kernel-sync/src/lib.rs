//! # Kernel synchronization primitives
//!
//! Lock-free and spinning building blocks for code that may run where
//! sleeping is not allowed:
//!
//! - [`RwSpinLock`]: many readers or one writer; readers only wait while a
//!   writer is active.
//! - [`RefGate`]: a reference count with a one-way "dead" switch, used to
//!   decide when a shared object may be torn down.
//! - [`SyncOnceCell`]: a write-once cell for explicitly initialized globals.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod ref_gate;
mod rw_spin_lock;
mod sync_once_cell;

pub use ref_gate::RefGate;
pub use rw_spin_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use sync_once_cell::SyncOnceCell;
