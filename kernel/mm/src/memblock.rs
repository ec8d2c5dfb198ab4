//! Bitmap-based boot-time page ownership.
//!
//! One bit per frame of a [`RamImage`]: 1 means owned (by firmware, the
//! kernel, a banned range, or a reservation), 0 means free. Frame 0 is
//! always owned so it can never be mistaken for a block.

use alloc::vec;
use alloc::vec::Vec;

use pram_core::banned::BannedRegions;
use pram_core::image::RamImage;
use pram_core::{Page, Pfn};

use crate::{PageReserver, RangeError};

const BITS_PER_WORD: u64 = 64;

/// Boot-time page ownership over a host memory image.
pub struct Memblock {
    image: RamImage,
    /// One bit per frame, set while the frame is owned.
    bitmap: Vec<u64>,
    total_frames: u64,
    /// Number of set bits.
    owned: u64,
}

impl core::fmt::Debug for Memblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memblock")
            .field("total_frames", &self.total_frames)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

impl Memblock {
    /// Tracks ownership of every frame in `image`.
    ///
    /// Frame 0 and every frame in `banned` start out owned.
    #[must_use]
    pub fn new<const N: usize>(image: RamImage, banned: &BannedRegions<N>) -> Self {
        let total_frames = image.frames();
        let words = total_frames.div_ceil(BITS_PER_WORD) as usize;
        let mut memblock = Self {
            image,
            bitmap: vec![0; words],
            total_frames,
            owned: 0,
        };

        if total_frames > 0 {
            memblock.mark(Pfn::NONE, 1);
        }
        for raw in 1..total_frames {
            let pfn = Pfn::new(raw);
            if banned.is_banned(pfn) {
                memblock.mark(pfn, 1);
            }
        }
        memblock
    }

    #[inline]
    fn bit(pfn: u64) -> (usize, u64) {
        ((pfn / BITS_PER_WORD) as usize, 1 << (pfn % BITS_PER_WORD))
    }

    fn mark(&mut self, pfn: Pfn, count: u64) {
        for raw in pfn.as_u64()..pfn.as_u64() + count {
            let (word, mask) = Self::bit(raw);
            debug_assert!(self.bitmap[word] & mask == 0, "frame {raw:x} owned twice");
            self.bitmap[word] |= mask;
        }
        self.owned += count;
    }

    /// Returns `true` if `pfn` is owned.
    #[must_use]
    pub fn is_reserved(&self, pfn: Pfn) -> bool {
        if pfn.as_u64() >= self.total_frames {
            return false;
        }
        let (word, mask) = Self::bit(pfn.as_u64());
        self.bitmap[word] & mask != 0
    }

    /// Returns `true` if any frame in `[pfn, pfn + count)` is owned.
    #[must_use]
    pub fn is_region_reserved(&self, pfn: Pfn, count: u64) -> bool {
        (pfn.as_u64()..pfn.as_u64().saturating_add(count)).any(|raw| self.is_reserved(Pfn::new(raw)))
    }

    /// Number of owned frames, including frame 0 and banned frames.
    #[must_use]
    pub fn owned_frames(&self) -> u64 {
        self.owned
    }

    /// The backing memory.
    #[must_use]
    pub fn image(&self) -> &RamImage {
        &self.image
    }

    /// The backing memory, writable. Used to simulate damage between passes.
    pub fn image_mut(&mut self) -> &mut RamImage {
        &mut self.image
    }
}

impl PageReserver for Memblock {
    fn frame_limit(&self) -> Pfn {
        Pfn::new(self.total_frames)
    }

    fn reserve_range(&mut self, pfn: Pfn, count: u64) -> Result<(), RangeError> {
        if !pfn.range_below(count, self.frame_limit()) {
            return Err(RangeError::OutOfRange);
        }
        if self.is_region_reserved(pfn, count) {
            return Err(RangeError::Busy);
        }
        self.mark(pfn, count);
        Ok(())
    }

    fn release_range(&mut self, pfn: Pfn, count: u64) {
        debug_assert!(pfn.range_below(count, self.frame_limit()));
        for raw in pfn.as_u64()..pfn.as_u64() + count {
            let (word, mask) = Self::bit(raw);
            debug_assert!(self.bitmap[word] & mask != 0, "frame {raw:x} released twice");
            self.bitmap[word] &= !mask;
        }
        self.owned -= count;
    }

    fn translate(&self, pfn: Pfn) -> Option<&Page> {
        self.image.page(pfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memblock(frames: usize) -> Memblock {
        Memblock::new(RamImage::zeroed(frames), &BannedRegions::<4>::new())
    }

    #[test]
    fn frame_zero_is_owned() {
        let mb = memblock(8);
        assert!(mb.is_reserved(Pfn::NONE));
        assert!(!mb.is_reserved(Pfn::new(1)));
        assert_eq!(mb.owned_frames(), 1);
        assert_eq!(mb.frame_limit(), Pfn::new(8));
    }

    #[test]
    fn banned_frames_are_owned() {
        let mut banned = BannedRegions::<4>::new();
        banned.ban(Pfn::new(4), Pfn::new(6)).unwrap();
        let mut mb = Memblock::new(RamImage::zeroed(8), &banned);
        assert!(mb.is_reserved(Pfn::new(5)));
        assert_eq!(mb.owned_frames(), 4);
        assert_eq!(mb.reserve_range(Pfn::new(3), 2), Err(RangeError::Busy));
    }

    #[test]
    fn reserve_and_release() {
        let mut mb = memblock(130);
        mb.reserve_range(Pfn::new(60), 8).unwrap();
        assert!(mb.is_region_reserved(Pfn::new(67), 1));
        assert_eq!(mb.owned_frames(), 9);
        assert_eq!(mb.reserve_range(Pfn::new(64), 1), Err(RangeError::Busy));
        mb.release_range(Pfn::new(60), 8);
        assert!(!mb.is_region_reserved(Pfn::new(60), 8));
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn out_of_range_reservation() {
        let mut mb = memblock(8);
        assert_eq!(mb.reserve_range(Pfn::new(7), 2), Err(RangeError::OutOfRange));
        assert_eq!(mb.reserve_range(Pfn::new(8), 1), Err(RangeError::OutOfRange));
        assert_eq!(mb.owned_frames(), 1);
    }

    #[test]
    fn translate_reads_image() {
        let mut image = RamImage::zeroed(4);
        image.page_mut(Pfn::new(2)).unwrap()[0] = 0x77;
        let mb = Memblock::new(image, &BannedRegions::<4>::new());
        assert_eq!(mb.translate(Pfn::new(2)).unwrap()[0], 0x77);
        assert!(mb.translate(Pfn::new(4)).is_none());
    }
}
