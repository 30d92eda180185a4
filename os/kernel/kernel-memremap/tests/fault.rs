#![cfg(feature = "device-private")]

use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::OffsetPhysMapper;
use kernel_memory_addresses::{
    PAGE_SHIFT, PAGE_SIZE, Pfn, PhysicalAddress, PhysicalRange, VirtualAddress,
};
use kernel_memremap::{
    DEVICE_PAGE_IDLE_REFCOUNT, DevPagemap, Device, FaultFlags, Memremap, MemoryType, Page,
    PagemapData, PagemapRegistry, PmdEntry, VmArea, VmFault, handle_device_private_fault,
    is_device_private_page, migrate_fault_window, page_is_cpu_addressable,
};
use std::sync::{Arc, Mutex};

const MAPPER: OffsetPhysMapper = OffsetPhysMapper::identity();

/// System frame a private page is migrated into.
const SYSTEM_PFN: u64 = 0x9_0000;

fn frames(start_pfn: u64, end_pfn: u64) -> PhysicalRange {
    PhysicalRange::new(
        PhysicalAddress::new(start_pfn << PAGE_SHIFT),
        (end_pfn - start_pfn) << PAGE_SHIFT,
    )
}

fn nop_free(_: &Page, _: Option<&PagemapData>) {}

fn vma() -> VmArea {
    VmArea::new(VirtualAddress::new(0x7000_0000), VirtualAddress::new(0x7010_0000))
}

fn user_write() -> FaultFlags {
    FaultFlags::new().with_user(true).with_write(true)
}

/// Pages handed back to the driver, in order.
type Freed = Arc<Mutex<Vec<Pfn>>>;

/// A private region whose fault handler migrates the faulting page and its
/// two neighbours through `migrate`, recording every attempt.
fn private_region(
    attempts: Arc<Mutex<Vec<u64>>>,
    freed: Freed,
    migrate: fn(u64) -> Result<(), VmFault>,
) -> Arc<DevPagemap> {
    DevPagemap::builder(
        frames(0x1000, 0x1040),
        MemoryType::Private,
        move |page: &Page, _: Option<&PagemapData>| freed.lock().unwrap().push(page.pfn()),
    )
    .page_fault(
        move |vma: &VmArea,
              addr: VirtualAddress,
              page: &Page,
              flags: FaultFlags,
              pmd: &mut PmdEntry|
              -> Result<(), VmFault> {
            assert!(vma.contains(addr));
            assert!(flags.user());
            assert!(!page_is_cpu_addressable(page));
            assert!(page.refcount() > DEVICE_PAGE_IDLE_REFCOUNT, "page held during fault");

            let neighbours = [addr.as_u64() - PAGE_SIZE, addr.as_u64() + PAGE_SIZE]
                .map(VirtualAddress::new)
                .into_iter()
                .filter(|a| vma.contains(*a));
            migrate_fault_window(addr, neighbours, |a| {
                attempts.lock().unwrap().push(a.as_u64());
                migrate(a.as_u64())
            })?;
            *pmd = PmdEntry::mapping(Pfn::new(SYSTEM_PFN), flags.write());
            Ok(())
        },
    )
    .build()
}

fn register(registry: &PagemapRegistry, pgmap: &Arc<DevPagemap>) {
    let mut general = BitmapFrameAlloc::<1>::new(PhysicalAddress::new(0x8000_0000), 8);
    let mut mm = Memremap::new(registry, &MAPPER, &mut general);
    mm.devm_memremap_pages(&Device::new("gpu0"), pgmap).unwrap();
}

#[test]
fn bus_error_is_reported_after_trying_the_faulting_page_first() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let freed = Freed::default();
    let pgmap = private_region(Arc::clone(&attempts), Arc::clone(&freed), |_| {
        Err(VmFault::SigBus)
    });
    let registry = PagemapRegistry::new();
    register(&registry, &pgmap);

    let mapped = registry.get_dev_page(Pfn::new(0x1005)).unwrap();
    let mut pmd = PmdEntry::new().with_present(true);
    let addr = VirtualAddress::new(0x7000_5123);
    let result = handle_device_private_fault(&vma(), addr, &mapped, user_write(), &mut pmd);

    assert_eq!(result, Err(VmFault::SigBus));
    assert!(!result.unwrap_err().is_retryable());
    assert!(pmd.poisoned());
    assert!(!pmd.present());
    assert_eq!(*attempts.lock().unwrap(), [0x7000_5000]);
    assert!(freed.lock().unwrap().is_empty(), "mapped page handed back");
    assert_eq!(mapped.page().refcount(), DEVICE_PAGE_IDLE_REFCOUNT + 1);
}

#[test]
fn neighbours_are_migrated_after_the_faulting_page() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let freed = Freed::default();
    let pgmap = private_region(Arc::clone(&attempts), Arc::clone(&freed), |_| Ok(()));
    let registry = PagemapRegistry::new();
    register(&registry, &pgmap);

    let mapped = registry.get_dev_page(Pfn::new(0x1005)).unwrap();
    let mut pmd = PmdEntry::new();
    let result = handle_device_private_fault(
        &vma(),
        VirtualAddress::new(0x7000_5000),
        &mapped,
        user_write(),
        &mut pmd,
    );

    assert_eq!(result, Ok(()));
    assert_eq!(
        *attempts.lock().unwrap(),
        [0x7000_5000, 0x7000_4000, 0x7000_6000]
    );
    assert_eq!(pmd.mapped_pfn(), Some(Pfn::new(SYSTEM_PFN)));
    assert!(pmd.writable());
    assert!(!pmd.poisoned());
    assert!(is_device_private_page(mapped.page()));

    // The old entry is gone once the replacement is installed.
    assert!(freed.lock().unwrap().is_empty());
    drop(mapped);
    assert_eq!(*freed.lock().unwrap(), [Pfn::new(0x1005)]);
}

#[test]
fn out_of_memory_is_retryable_and_keeps_the_page_mapped() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let freed = Freed::default();
    let pgmap = private_region(Arc::clone(&attempts), Arc::clone(&freed), |_| {
        Err(VmFault::Oom)
    });
    let registry = PagemapRegistry::new();
    register(&registry, &pgmap);

    let mapped = registry.get_dev_page(Pfn::new(0x1001)).unwrap();
    for _ in 0..2 {
        let mut pmd = PmdEntry::new();
        let result = handle_device_private_fault(
            &vma(),
            VirtualAddress::new(0x7000_1000),
            &mapped,
            user_write(),
            &mut pmd,
        );
        assert_eq!(result, Err(VmFault::Oom));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(pmd, PmdEntry::new());
    }

    assert!(freed.lock().unwrap().is_empty(), "mapped page handed back");
    assert_eq!(mapped.page().refcount(), DEVICE_PAGE_IDLE_REFCOUNT + 1);
}

#[test]
fn faults_outside_private_memory_are_bus_errors() {
    let registry = PagemapRegistry::new();
    let host = DevPagemap::builder(frames(0x2000, 0x2010), MemoryType::Host, nop_free).build();
    register(&registry, &host);

    let mapped = registry.get_dev_page(Pfn::new(0x2000)).unwrap();
    let mut pmd = PmdEntry::new();
    let on_host = handle_device_private_fault(
        &vma(),
        VirtualAddress::new(0x7000_0000),
        &mapped,
        FaultFlags::new(),
        &mut pmd,
    );
    assert_eq!(on_host, Err(VmFault::SigBus));
    assert!(pmd.poisoned());

    assert!(registry.get_dev_page(Pfn::new(0x5000)).is_none());
}
