#![cfg(feature = "zone-device")]

use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::OffsetPhysMapper;
use kernel_memory_addresses::{PAGE_SHIFT, Pfn, PhysicalAddress, PhysicalRange};
use kernel_memremap::{
    DEVICE_PAGE_IDLE_REFCOUNT, DevPagemap, Device, Memremap, MemoryType, Page, PagemapData,
    PagemapRegistry, PagemapState, TeardownError, put_dev_pagemap,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

const MAPPER: OffsetPhysMapper = OffsetPhysMapper::identity();

fn frames(start_pfn: u64, end_pfn: u64) -> PhysicalRange {
    PhysicalRange::new(
        PhysicalAddress::new(start_pfn << PAGE_SHIFT),
        (end_pfn - start_pfn) << PAGE_SHIFT,
    )
}

fn nop_free(_: &Page, _: Option<&PagemapData>) {}

fn general_memory() -> BitmapFrameAlloc<1> {
    BitmapFrameAlloc::new(PhysicalAddress::new(0x8000_0000), 64)
}

#[test]
fn draining_region_rejects_lookups_but_accepts_releases() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1100), MemoryType::Host, nop_free).build();
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();

    let held = registry.get_dev_pagemap(Pfn::new(0x1010), None).unwrap();
    assert_eq!(pgmap.ref_count(), 2);

    assert_eq!(
        mm.try_memunmap_pages(&pgmap),
        Err(TeardownError::Busy { outstanding: 1 })
    );
    assert_eq!(pgmap.state(), PagemapState::Draining);
    assert!(registry.get_dev_pagemap(Pfn::new(0x1010), None).is_none());

    // Existing holders keep working and may still hand out copies.
    assert!(held.page(Pfn::new(0x1010)).is_some());
    let copy = held.clone();
    assert_eq!(pgmap.ref_count(), 2);
    drop(copy);

    let released = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            released.store(true, Ordering::SeqCst);
            put_dev_pagemap(Some(held));
        });
        mm.memunmap_pages(&pgmap).unwrap();
        assert!(
            released.load(Ordering::SeqCst),
            "teardown finished before the last release"
        );
    });

    assert_eq!(pgmap.state(), PagemapState::Reclaimed);
    assert_eq!(pgmap.ref_count(), 0);
    assert!(registry.is_empty());
}

#[test]
fn non_blocking_teardown_resumes() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1040), MemoryType::Host, nop_free).build();
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();

    let a = registry.get_dev_pagemap(Pfn::new(0x1000), None).unwrap();
    let b = registry.get_dev_pagemap(Pfn::new(0x103f), None).unwrap();

    assert_eq!(
        mm.try_memunmap_pages(&pgmap),
        Err(TeardownError::Busy { outstanding: 2 })
    );
    drop(a);
    assert_eq!(
        mm.try_memunmap_pages(&pgmap),
        Err(TeardownError::Busy { outstanding: 1 })
    );
    drop(b);
    assert_eq!(mm.try_memunmap_pages(&pgmap), Ok(()));
    assert_eq!(pgmap.state(), PagemapState::Reclaimed);
}

#[test]
fn teardown_of_an_idle_region_does_not_block() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1040), MemoryType::Host, nop_free).build();

    assert_eq!(
        mm.try_memunmap_pages(&pgmap),
        Err(TeardownError::NotRegistered(PagemapState::Unregistered))
    );
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();
    assert_eq!(mm.try_memunmap_pages(&pgmap), Ok(()));
}

#[test]
fn hint_covering_the_frame_is_reused() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let dev = Device::new("gpu0");
    let lo = DevPagemap::builder(frames(0x1000, 0x1040), MemoryType::Host, nop_free).build();
    let hi = DevPagemap::builder(frames(0x2000, 0x2040), MemoryType::Host, nop_free).build();
    mm.devm_memremap_pages(&dev, &lo).unwrap();
    mm.devm_memremap_pages(&dev, &hi).unwrap();

    let r = registry.get_dev_pagemap(Pfn::new(0x1000), None).unwrap();
    assert_eq!(lo.ref_count(), 2);
    let r = registry.get_dev_pagemap(Pfn::new(0x1001), Some(r)).unwrap();
    assert_eq!(lo.ref_count(), 2, "a covering hint is handed back as is");

    let r = registry.get_dev_pagemap(Pfn::new(0x2000), Some(r)).unwrap();
    assert!(Arc::ptr_eq(r.pagemap(), &hi));
    assert_eq!(lo.ref_count(), 1, "a stale hint is released");
    assert_eq!(hi.ref_count(), 2);

    assert!(registry.get_dev_pagemap(Pfn::new(0x3000), Some(r)).is_none());
    assert_eq!(hi.ref_count(), 1);
    put_dev_pagemap(None);
}

#[test]
fn free_callback_runs_when_a_page_goes_idle() {
    let freed = Arc::new(Mutex::new(Vec::new()));
    let pgmap = {
        let freed = Arc::clone(&freed);
        DevPagemap::builder(
            frames(0x1000, 0x1040),
            MemoryType::Host,
            move |page: &Page, data: Option<&PagemapData>| {
                let tag = data.and_then(|d| d.downcast_ref::<&str>()).copied();
                freed.lock().unwrap().push((page.pfn(), tag));
            },
        )
        .data("gpu0-vram")
        .build()
    };

    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    mm.devm_memremap_pages(&Device::new("gpu0"), &pgmap).unwrap();

    let page = registry.get_dev_page(Pfn::new(0x1005)).unwrap();
    assert_eq!(page.page().refcount(), DEVICE_PAGE_IDLE_REFCOUNT + 1);
    let second = page.clone();
    assert_eq!(page.page().refcount(), DEVICE_PAGE_IDLE_REFCOUNT + 2);

    drop(page);
    assert!(freed.lock().unwrap().is_empty());
    drop(second);
    assert_eq!(
        *freed.lock().unwrap(),
        [(Pfn::new(0x1005), Some("gpu0-vram"))]
    );
    assert_eq!(pgmap.ref_count(), 1, "page references hold the region");
}

#[test]
fn page_references_hold_off_teardown() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1040), MemoryType::Host, nop_free).build();
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();

    let page = registry.get_dev_page(Pfn::new(0x1020)).unwrap();
    assert_eq!(
        mm.try_memunmap_pages(&pgmap),
        Err(TeardownError::Busy { outstanding: 1 })
    );
    assert!(registry.get_dev_page(Pfn::new(0x1021)).is_none());
    drop(page);
    assert_eq!(mm.try_memunmap_pages(&pgmap), Ok(()));
}

#[test]
fn altmap_frames_have_no_page_descriptor() {
    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1100), MemoryType::Host, nop_free)
        .altmap(kernel_memremap::VmemAltmap::new(Pfn::new(0x1000), 0, 4))
        .build();
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();

    // The carve-out still belongs to the region.
    let r = registry.get_dev_pagemap(Pfn::new(0x1001), None).unwrap();
    assert!(r.page(Pfn::new(0x1001)).is_none());
    assert!(registry.get_dev_page(Pfn::new(0x1001)).is_none());
    assert!(registry.get_dev_page(Pfn::new(0x1004)).is_some());
}

#[test]
fn no_reference_is_handed_out_once_teardown_started() {
    const THREADS: usize = 8;

    let registry = PagemapRegistry::new();
    let mut general = general_memory();
    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1100), MemoryType::Host, nop_free).build();
    mm.devm_memremap_pages(&Device::new("pmem0"), &pgmap).unwrap();

    let start = Barrier::new(THREADS + 1);
    let stopped = AtomicBool::new(false);
    let lookups = AtomicUsize::new(0);
    let registry = &registry;
    let pgmap = &pgmap;

    thread::scope(|s| {
        for t in 0..THREADS as u64 {
            let (start, stopped, lookups) = (&start, &stopped, &lookups);
            s.spawn(move || {
                start.wait();
                let pfn = Pfn::new(0x1000 + t * 0x20);
                while !stopped.load(Ordering::Acquire) {
                    let active_before = pgmap.state() == PagemapState::Active;
                    if let Some(r) = registry.get_dev_pagemap(pfn, None) {
                        assert!(active_before, "reference taken on a draining region");
                        assert_ne!(r.state(), PagemapState::Reclaimed);
                        lookups.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }

        start.wait();
        while lookups.load(Ordering::Relaxed) < THREADS {
            thread::yield_now();
        }
        mm.memunmap_pages(pgmap).unwrap();
        assert!(registry.get_dev_pagemap(Pfn::new(0x1000), None).is_none());
        stopped.store(true, Ordering::Release);
    });

    assert_eq!(pgmap.state(), PagemapState::Reclaimed);
    assert_eq!(pgmap.ref_count(), 0);
}

#[test]
fn teardown_through_another_registry_leaves_the_region_alone() {
    let registry = PagemapRegistry::new();
    let elsewhere = PagemapRegistry::new();
    let mut general = general_memory();
    let pgmap = DevPagemap::builder(frames(0x1000, 0x1040), MemoryType::Host, nop_free).build();
    Memremap::new(&registry, &MAPPER, &mut general)
        .devm_memremap_pages(&Device::new("pmem0"), &pgmap)
        .unwrap();

    let mut wrong = Memremap::new(&elsewhere, &MAPPER, &mut general);
    assert_eq!(
        wrong.memunmap_pages(&pgmap),
        Err(TeardownError::NotRegistered(PagemapState::Active))
    );
    assert_eq!(
        wrong.try_memunmap_pages(&pgmap),
        Err(TeardownError::NotRegistered(PagemapState::Active))
    );
    assert_eq!(pgmap.state(), PagemapState::Active);
    assert!(registry.get_dev_pagemap(Pfn::new(0x1000), None).is_some());

    let mut mm = Memremap::new(&registry, &MAPPER, &mut general);
    assert_eq!(mm.memunmap_pages(&pgmap), Ok(()));
    assert_eq!(pgmap.state(), PagemapState::Reclaimed);
    assert_eq!(general.in_use(), 0);
}
