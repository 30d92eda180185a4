use crate::pagemap::DevPagemap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use kernel_sync::RwSpinLock;

/// A device that registers memory regions.
///
/// Cloning is cheap and yields another handle to the same device. The device
/// keeps every region registered for it until the region is torn down or
/// the device is released with
/// [`Memremap::release_device`](crate::Memremap::release_device).
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    name: String,
    managed: RwSpinLock<Vec<Arc<DevPagemap>>>,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                name: name.into(),
                managed: RwSpinLock::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of regions currently registered for this device.
    #[must_use]
    pub fn managed_count(&self) -> usize {
        self.inner.managed.read().len()
    }

    /// Whether `pgmap` is registered for this device.
    #[must_use]
    pub fn manages(&self, pgmap: &Arc<DevPagemap>) -> bool {
        self.inner.managed.read().iter().any(|p| Arc::ptr_eq(p, pgmap))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn push_managed(&self, pgmap: Arc<DevPagemap>) {
        self.inner.managed.write().push(pgmap);
    }

    pub(crate) fn remove_managed(&self, pgmap: &Arc<DevPagemap>) -> bool {
        let mut managed = self.inner.managed.write();
        let Some(pos) = managed.iter().rposition(|p| Arc::ptr_eq(p, pgmap)) else {
            return false;
        };
        managed.remove(pos);
        true
    }

    /// The most recently registered region.
    pub(crate) fn last_managed(&self) -> Option<Arc<DevPagemap>> {
        self.inner.managed.read().last().cloned()
    }

    pub(crate) fn downgrade(&self) -> Weak<DeviceInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<DeviceInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("managed", &self.managed_count())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
