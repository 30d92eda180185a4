//! Physical frame allocators.
//!
//! [`BitmapFrameAlloc`] hands out frames from one contiguous window and keeps
//! one bit per frame, so it needs no heap. [`NoFrameAlloc`] never has a frame
//! to give; it stands in where falling back to the general allocator is not
//! allowed.

use crate::FrameAlloc;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, is_page_aligned};

/// Bitmap allocator over `[base, base + nr_frames * 4K)`.
///
/// `WORDS` fixes the bitmap capacity at `WORDS * 64` frames.
pub struct BitmapFrameAlloc<const WORDS: usize> {
    base: PhysicalAddress,
    nr_frames: usize,
    used: [u64; WORDS],
    in_use: usize,
}

impl<const WORDS: usize> BitmapFrameAlloc<WORDS> {
    /// # Panics
    /// If `base` is not page aligned or `nr_frames` exceeds the bitmap capacity.
    #[must_use]
    pub const fn new(base: PhysicalAddress, nr_frames: usize) -> Self {
        assert!(is_page_aligned(base.as_u64()), "frame window must be page aligned");
        assert!(nr_frames <= WORDS * 64, "frame window exceeds bitmap capacity");
        Self {
            base,
            nr_frames,
            used: [0; WORDS],
            in_use: 0,
        }
    }

    /// Frames currently handed out.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    /// Frames still available.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.nr_frames - self.in_use
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        let off = pa.as_u64().checked_sub(self.base.as_u64())?;
        if !is_page_aligned(off) {
            return None;
        }
        let idx = (off >> PAGE_SHIFT) as usize;
        (idx < self.nr_frames).then_some(idx)
    }
}

impl<const WORDS: usize> FrameAlloc for BitmapFrameAlloc<WORDS> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        for (w, word) in self.used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let idx = w * 64 + bit;
            if idx >= self.nr_frames {
                break;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            let pa = self.base + idx as u64 * PAGE_SIZE;
            log::trace!("frame_alloc: alloc {pa}");
            return Some(pa);
        }
        None
    }

    /// # Panics
    /// If `pa` is outside the window or not currently allocated (double free).
    fn free_4k(&mut self, pa: PhysicalAddress) {
        let Some(idx) = self.index_of(pa) else {
            panic!("frame_alloc: {pa} is not managed by this allocator");
        };
        let (w, bit) = (idx / 64, idx % 64);
        assert!(self.used[w] & (1 << bit) != 0, "frame_alloc: double free of {pa}");
        self.used[w] &= !(1 << bit);
        self.in_use -= 1;
        log::trace!("frame_alloc: free {pa}");
    }
}

/// An allocator that is always exhausted.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoFrameAlloc;

impl FrameAlloc for NoFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        None
    }

    /// # Panics
    /// Always; nothing was ever handed out.
    fn free_4k(&mut self, pa: PhysicalAddress) {
        panic!("frame_alloc: {pa} freed to an allocator that never allocates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_in_order_until_exhausted() {
        let mut a = BitmapFrameAlloc::<1>::new(PhysicalAddress::new(0x10_0000), 3);
        assert_eq!(a.alloc_4k(), Some(PhysicalAddress::new(0x10_0000)));
        assert_eq!(a.alloc_4k(), Some(PhysicalAddress::new(0x10_1000)));
        assert_eq!(a.alloc_4k(), Some(PhysicalAddress::new(0x10_2000)));
        assert_eq!(a.alloc_4k(), None);
        assert_eq!(a.in_use(), 3);
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut a = BitmapFrameAlloc::<2>::new(PhysicalAddress::new(0), 100);
        let frames: Vec<_> = (0..70).map(|_| a.alloc_4k().unwrap()).collect();
        a.free_4k(frames[65]);
        assert_eq!(a.alloc_4k(), Some(frames[65]));
        assert_eq!(a.available(), 30);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut a = BitmapFrameAlloc::<1>::new(PhysicalAddress::new(0), 4);
        let pa = a.alloc_4k().unwrap();
        a.free_4k(pa);
        a.free_4k(pa);
    }

    #[test]
    fn no_frame_alloc_is_always_empty() {
        assert_eq!(NoFrameAlloc.alloc_4k(), None);
    }
}
