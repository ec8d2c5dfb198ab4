//! Page frame numbers.

use core::fmt;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page frame and of every metadata block.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The contents of one page frame.
pub type Page = [u8; PAGE_SIZE];

/// A physical page frame number.
///
/// Frame 0 is never a valid block or extent; on media it terminates lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pfn(u64);

impl Pfn {
    /// The "no next frame" sentinel.
    pub const NONE: Self = Self(0);

    /// Creates a frame number.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for the list terminator.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Converts to `Some(self)` unless this is the terminator.
    #[inline]
    pub const fn non_null(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }

    /// Returns the frame `count` frames after this one.
    ///
    /// Saturates instead of wrapping; callers range-check against the frame
    /// limit before use.
    #[inline]
    #[must_use]
    pub const fn add(self, count: u64) -> Self {
        Self(self.0.saturating_add(count))
    }

    /// Returns `true` if `[self, self + count)` lies below `limit`.
    #[inline]
    pub const fn range_below(self, count: u64, limit: Self) -> bool {
        match self.0.checked_add(count) {
            Some(end) => end <= limit.0,
            None => false,
        }
    }

    /// Byte offset of the frame in physical memory.
    #[inline]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl From<u32> for Pfn {
    fn from(raw: u32) -> Self {
        Self(u64::from(raw))
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
