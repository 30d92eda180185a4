//! Registration and teardown of device memory regions.

use crate::altmap::{VmemAltmap, vmem_altmap_free};
use crate::device::Device;
use crate::error::{MemremapError, TeardownError};
use crate::page::Memmap;
use crate::pagemap::{DevPagemap, PagemapState};
use crate::registry::{Mapping, MemmapBacking, PagemapRegistry};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::memory::{MAX_PHYSICAL_ADDRESS, memmap_pages};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange, VirtualAddress};

static WARNED_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

/// Page metadata placed but not yet committed.
struct Populated {
    backing: MemmapBacking,
    /// The altmap after the allocation, written back once the region is live.
    altmap: Option<VmemAltmap>,
}

/// Registers device memory with a [`PagemapRegistry`].
///
/// `mapper` yields the kernel virtual alias of a region. `alloc` is the
/// general frame allocator, only used for page metadata of regions whose
/// altmap is absent or too small.
pub struct Memremap<'m, M: PhysMapper, A: FrameAlloc> {
    registry: &'m PagemapRegistry,
    mapper: &'m M,
    alloc: &'m mut A,
}

impl<'m, M: PhysMapper, A: FrameAlloc> Memremap<'m, M, A> {
    #[must_use]
    pub const fn new(registry: &'m PagemapRegistry, mapper: &'m M, alloc: &'m mut A) -> Self {
        Self {
            registry,
            mapper,
            alloc,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &'m PagemapRegistry {
        self.registry
    }

    /// Register `pgmap` for `dev` and return the kernel virtual address of
    /// the region.
    ///
    /// On success every frame of the range resolves through the registry
    /// and the region is recorded in the device's managed list. On failure
    /// nothing is left behind: no registry entry, no allocated frames, and
    /// the altmap unchanged.
    ///
    /// # Errors
    /// - [`MemremapError::Unsupported`] without device memory support.
    /// - [`MemremapError::TypeUnsupported`] if the region's type is not built.
    /// - [`MemremapError::InvalidRange`] for an empty, unaligned or
    ///   unaddressable range, or one `mapper` has no alias for.
    /// - [`MemremapError::InvalidDescriptor`] if `pgmap` fails validation.
    /// - [`MemremapError::AlreadyRegistered`] unless `pgmap` is unregistered
    ///   or reclaimed.
    /// - [`MemremapError::Conflict`] if the range overlaps a registered one.
    /// - [`MemremapError::OutOfMemory`] if the page descriptors can not be
    ///   allocated, or their backing fits neither the altmap nor the general
    ///   allocator.
    pub fn devm_memremap_pages(
        &mut self,
        dev: &Device,
        pgmap: &Arc<DevPagemap>,
    ) -> Result<VirtualAddress, MemremapError> {
        if !cfg!(feature = "zone-device") {
            if !WARNED_UNSUPPORTED.swap(true, Ordering::Relaxed) {
                log::warn!("memremap: {dev} requested device memory, but support is not built");
            }
            return Err(MemremapError::Unsupported);
        }

        let ty = pgmap.memory_type();
        if !ty.is_enabled() {
            return Err(MemremapError::TypeUnsupported(ty));
        }
        // The range comes first: descriptor checks do arithmetic on it.
        let res = pgmap.range();
        if !is_platform_range(&res) {
            return Err(MemremapError::InvalidRange(res));
        }
        pgmap.validate()?;
        let base = self.direct_map(&res).ok_or(MemremapError::InvalidRange(res))?;

        let prev = Self::claim(pgmap)?;
        let result = self.install(dev, pgmap, base);
        if result.is_err() {
            pgmap.set_state(prev);
        }
        result
    }

    /// Mark `pgmap` as being registered; returns the state it came from.
    fn claim(pgmap: &DevPagemap) -> Result<PagemapState, MemremapError> {
        for from in [PagemapState::Unregistered, PagemapState::Reclaimed] {
            match pgmap.transition(from, PagemapState::Active) {
                Ok(()) => return Ok(from),
                Err(PagemapState::Unregistered | PagemapState::Reclaimed) => {}
                Err(other) => return Err(MemremapError::AlreadyRegistered(other)),
            }
        }
        Err(MemremapError::AlreadyRegistered(pgmap.state()))
    }

    /// The alias of `res` in the direct map, if the map reaches all of it.
    fn direct_map(&self, res: &PhysicalRange) -> Option<VirtualAddress> {
        let last = PhysicalAddress::new(res.end().as_u64().checked_sub(1)?);
        self.mapper.phys_to_virt(last)?;
        self.mapper.phys_to_virt(res.start())
    }

    fn install(
        &mut self,
        dev: &Device,
        pgmap: &Arc<DevPagemap>,
        base: VirtualAddress,
    ) -> Result<VirtualAddress, MemremapError> {
        let res = pgmap.range();
        if let Some(existing) = self.registry.conflicting(&res) {
            log::debug!("memremap: {dev}: {res} overlaps {existing}");
            return Err(MemremapError::Conflict {
                requested: res,
                existing,
            });
        }

        let first = pgmap.pfn_first();
        let nr_pages = pgmap.pfn_end() - first;
        let nr_descriptors =
            usize::try_from(nr_pages).map_err(|_| MemremapError::InvalidRange(res))?;
        let memmap = Memmap::try_new(first, nr_descriptors, pgmap.memory_type()).map_err(|e| {
            log::debug!("memremap: {dev}: no room for {nr_descriptors} page descriptors: {e}");
            MemremapError::OutOfMemory {
                needed: memmap_pages(nr_pages),
            }
        })?;
        let populated = self.populate_memmap(pgmap, nr_pages)?;

        let mapping = Arc::new(Mapping {
            pgmap: Arc::clone(pgmap),
            memmap,
            base,
            backing: populated.backing,
        });

        pgmap.gate().reinit();
        if let Err(existing) = self.registry.insert(Arc::clone(&mapping)) {
            pgmap.gate().kill();
            if let MemmapBacking::Frames(frames) = &mapping.backing {
                self.free_frames(frames);
            }
            return Err(MemremapError::Conflict {
                requested: res,
                existing,
            });
        }

        if let Some(altmap) = populated.altmap {
            pgmap.commit_altmap(altmap);
        }
        pgmap.set_owner(Some(dev));
        dev.push_managed(Arc::clone(pgmap));

        log::info!(
            "memremap: {dev}: {} {res} at {base}, {nr_pages} pages, {} metadata pages",
            pgmap.memory_type(),
            mapping.backing.nr_pages(),
        );
        Ok(base)
    }

    /// Find storage for the descriptors of `nr_pages` device pages.
    fn populate_memmap(
        &mut self,
        pgmap: &DevPagemap,
        nr_pages: u64,
    ) -> Result<Populated, MemremapError> {
        let needed = memmap_pages(nr_pages);

        if let Some(mut altmap) = pgmap.altmap() {
            let align_before = altmap.align();
            if let Some(first) = altmap.alloc_pages(needed) {
                log::debug!("memremap: {needed} metadata pages in altmap at {first:?}");
                return Ok(Populated {
                    backing: MemmapBacking::Altmap {
                        nr: needed,
                        align: altmap.align() - align_before,
                    },
                    altmap: Some(altmap),
                });
            }
            log::debug!(
                "memremap: altmap has {} of {needed} metadata pages, falling back",
                altmap.nr_free()
            );
        }

        let mut frames = Vec::new();
        for _ in 0..needed {
            let Some(pa) = self.alloc.alloc_4k() else {
                self.free_frames(&frames);
                log::debug!(
                    "memremap: out of memory after {} of {needed} metadata pages",
                    frames.len()
                );
                return Err(MemremapError::OutOfMemory { needed });
            };
            frames.push(pa);
        }
        Ok(Populated {
            backing: MemmapBacking::Frames(frames),
            altmap: None,
        })
    }

    fn free_frames(&mut self, frames: &[PhysicalAddress]) {
        for &pa in frames {
            self.alloc.free_4k(pa);
        }
    }

    /// Tear down `pgmap`, waiting for every outstanding reference.
    ///
    /// New lookups fail as soon as this starts. Holders of existing
    /// references keep using the region until they release it.
    ///
    /// # Errors
    /// [`TeardownError::NotRegistered`] if the region is not registered with
    /// this registry, or another caller reclaimed it first.
    pub fn memunmap_pages(&mut self, pgmap: &Arc<DevPagemap>) -> Result<(), TeardownError> {
        self.begin_teardown(pgmap)?;
        pgmap.gate().wait_for_quiescence();
        self.finish_teardown(pgmap)
    }

    /// Tear down `pgmap` if nobody holds it, without blocking.
    ///
    /// # Errors
    /// - [`TeardownError::NotRegistered`] as for
    ///   [`memunmap_pages`](Self::memunmap_pages).
    /// - [`TeardownError::Busy`] while references are outstanding. The region
    ///   stays draining; call again to finish.
    pub fn try_memunmap_pages(&mut self, pgmap: &Arc<DevPagemap>) -> Result<(), TeardownError> {
        self.begin_teardown(pgmap)?;
        let outstanding = pgmap.gate().count();
        if outstanding != 0 {
            return Err(TeardownError::Busy { outstanding });
        }
        self.finish_teardown(pgmap)
    }

    /// Tear down every region registered for `dev`, newest first.
    ///
    /// Returns how many regions were reclaimed.
    pub fn release_device(&mut self, dev: &Device) -> usize {
        let mut released = 0;
        while let Some(pgmap) = dev.last_managed() {
            match self.memunmap_pages(&pgmap) {
                Ok(()) => released += 1,
                Err(e) => log::warn!("memremap: {dev}: dropping {}: {e}", pgmap.range()),
            }
            dev.remove_managed(&pgmap);
        }
        released
    }

    /// Stop new lookups. Resumes silently on a region already draining.
    ///
    /// The gate dies before the state reads `Draining`, so no reference is
    /// taken on a region once it is seen draining.
    fn begin_teardown(&self, pgmap: &Arc<DevPagemap>) -> Result<(), TeardownError> {
        if !self.registry.contains(pgmap) {
            return Err(TeardownError::NotRegistered(pgmap.state()));
        }
        if let Some(quiescent) = pgmap.gate().try_kill() {
            pgmap.set_state(PagemapState::Draining);
            if !quiescent {
                log::debug!(
                    "memremap: {} draining, {} references outstanding",
                    pgmap.range(),
                    pgmap.ref_count()
                );
            }
            return Ok(());
        }
        // Another caller killed the gate and is about to publish the state.
        loop {
            match pgmap.state() {
                PagemapState::Active => spin_loop(),
                PagemapState::Draining => return Ok(()),
                state => return Err(TeardownError::NotRegistered(state)),
            }
        }
    }

    /// Return a quiescent region's metadata and mark it reclaimed.
    fn finish_teardown(&mut self, pgmap: &Arc<DevPagemap>) -> Result<(), TeardownError> {
        let Some(mapping) = self.registry.remove(pgmap) else {
            return Err(TeardownError::NotRegistered(pgmap.state()));
        };

        match &mapping.backing {
            MemmapBacking::Altmap { nr, align } => pgmap.with_altmap(|altmap| {
                vmem_altmap_free(altmap, *nr);
                altmap.release_alignment(*align);
            }),
            MemmapBacking::Frames(frames) => self.free_frames(frames),
        }

        if let Some(dev) = pgmap.owner() {
            dev.remove_managed(pgmap);
        }
        pgmap.set_owner(None);
        pgmap.set_state(PagemapState::Reclaimed);
        log::info!("memremap: {} {} reclaimed", pgmap.memory_type(), pgmap.range());
        Ok(())
    }
}

/// The range can be mapped on this platform at all.
const fn is_platform_range(res: &PhysicalRange) -> bool {
    !res.is_empty() && res.is_page_aligned() && res.end().as_u64() <= MAX_PHYSICAL_ADDRESS
}
