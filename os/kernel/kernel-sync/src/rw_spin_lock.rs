use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Set while a writer holds the lock.
const WRITER: usize = 1 << (usize::BITS - 1);
/// Set while a writer is waiting; new readers back off so writers are not starved.
const WRITER_WAITING: usize = 1 << (usize::BITS - 2);
const READERS_MASK: usize = !(WRITER | WRITER_WAITING);

/// Reader/writer spin lock.
///
/// Many readers may hold the lock at once; a writer holds it alone. Readers
/// never sleep, they spin only while a writer is inside the critical section
/// (or announced itself), which keeps the read side usable from contexts
/// that must not block.
pub struct RwSpinLock<T> {
    /// lock state
    /// * bit 63: writer active
    /// * bit 62: writer waiting
    /// * remaining bits: active reader count
    state: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: readers share &T across threads (T: Sync), writers move &mut T (T: Send).
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> RwSpinLock<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once to take a shared guard.
    #[inline]
    #[must_use]
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_WAITING) != 0 {
            return None;
        }
        assert!(s & READERS_MASK != READERS_MASK, "reader count overflow");
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    /// Spin until a shared guard is available.
    #[inline]
    #[must_use]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            while self.state.load(Ordering::Relaxed) & (WRITER | WRITER_WAITING) != 0 {
                spin_loop();
            }
        }
    }

    /// Try once to take the exclusive guard.
    #[inline]
    #[must_use]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    /// Spin until the exclusive guard is available.
    ///
    /// The waiting bit keeps new readers out while the current ones drain.
    #[inline]
    #[must_use]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0 && s & READERS_MASK == 0 {
                if self
                    .state
                    .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwSpinWriteGuard { lock: self };
                }
                continue;
            }
            if s & WRITER_WAITING == 0 {
                let _ = self.state.compare_exchange(
                    s,
                    s | WRITER_WAITING,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            spin_loop();
        }
    }

    /// Closure convenience for the shared side.
    #[inline]
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let g = self.read();
        f(&g)
    }

    /// Closure convenience for the exclusive side.
    #[inline]
    pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.write();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: no writer can be active while a read guard exists.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Clears WRITER and any WRITER_WAITING set while we held the lock;
        // a still-waiting writer sets it again on its next spin.
        self.lock.state.store(0, Ordering::Release);
    }
}
