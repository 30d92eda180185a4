use crate::{MemoryType, PagemapError, PagemapState};
use kernel_memory_addresses::PhysicalRange;

/// Why a region could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemremapError {
    /// Device memory support is not built into this kernel.
    #[error("device memory support is not configured")]
    Unsupported,
    /// The region's memory type is not built into this kernel.
    #[error("{0} device memory is not configured")]
    TypeUnsupported(MemoryType),
    #[error("invalid region descriptor: {0}")]
    InvalidDescriptor(#[from] PagemapError),
    /// The range is empty, unaligned, or beyond the platform's physical
    /// address space.
    #[error("invalid physical range {0}")]
    InvalidRange(PhysicalRange),
    #[error("region is already registered (state {0})")]
    AlreadyRegistered(PagemapState),
    #[error("range {requested} conflicts with registered range {existing}")]
    Conflict {
        requested: PhysicalRange,
        existing: PhysicalRange,
    },
    /// Neither the altmap nor the general allocator could hold the
    /// region's page metadata.
    #[error("out of memory for {needed} pages of page metadata")]
    OutOfMemory { needed: u64 },
    #[error("the global pagemap registry is already initialized")]
    AlreadyInitialized,
}

impl MemremapError {
    /// Errors caused by how the kernel was built rather than by the request.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Unsupported | Self::TypeUnsupported(_))
    }
}

/// Why a region could not be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TeardownError {
    #[error("region is not registered (state {0})")]
    NotRegistered(PagemapState),
    /// References are still outstanding; the region stays draining and a
    /// later call picks up where this one stopped.
    #[error("region is draining with {outstanding} outstanding references")]
    Busy { outstanding: usize },
}
