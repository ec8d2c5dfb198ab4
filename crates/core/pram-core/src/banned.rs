//! Frame ranges that persistent memory must never claim.
//!
//! The memory manager bans the ranges backing the kernel image, firmware
//! tables and RAM holes while it sets itself up. Ranges are kept in a
//! fixed-capacity array sorted by start frame; they never overlap and
//! touching ranges are always merged, so membership is a binary search.

use core::cmp::Ordering;
use core::fmt;

use planck_noalloc::vec::ArrayVec;

use crate::frame::Pfn;
use crate::{kdebug, kerr, kinfo};

/// Upper bound on NUMA nodes the table is sized for.
pub const MAX_NUMA_NODES: usize = 64;

/// Capacity of the banned-region table.
pub const MAX_BANNED_REGIONS: usize = 32 + MAX_NUMA_NODES * 2;

/// An inclusive range of banned frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BannedRegion {
    /// First banned frame.
    pub start: u64,
    /// Last banned frame (inclusive).
    pub end: u64,
}

impl BannedRegion {
    /// Number of frames in the region.
    pub const fn pages(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Errors from [`BannedRegions::ban`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanError {
    /// The range touches no existing region and the table is full.
    CapacityExceeded,
    /// `start` is greater than `end`.
    InvalidRange,
}

impl fmt::Display for BanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded => f.write_str("too many banned regions"),
            Self::InvalidRange => f.write_str("range start is past its end"),
        }
    }
}

impl core::error::Error for BanError {}

/// Totals reported by [`BannedRegions::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BannedSummary {
    /// Number of regions in the table.
    pub regions: usize,
    /// Frames covered by all regions.
    pub pages: u64,
}

/// Sorted, non-overlapping table of banned frame ranges.
///
/// Not synchronized: bans happen during single-threaded memory setup.
pub struct BannedRegions<const N: usize = MAX_BANNED_REGIONS> {
    regions: ArrayVec<BannedRegion, N>,
    /// Set while reservation runs; bans are ignored meanwhile.
    frozen: bool,
}

impl<const N: usize> fmt::Debug for BannedRegions<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BannedRegions")
            .field("regions", &self.regions.as_slice())
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl<const N: usize> Default for BannedRegions<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BannedRegions<N> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: ArrayVec::new(),
            frozen: false,
        }
    }

    /// Bans the inclusive frame range `[start, end]`.
    ///
    /// Every existing region overlapping or adjacent to the range is merged
    /// with it into a single region. A ban issued while the table is frozen
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BanError::CapacityExceeded`] (after logging it) when the
    /// range would need a new slot in a full table, and
    /// [`BanError::InvalidRange`] for an inverted range. The table is left
    /// unchanged in both cases.
    pub fn ban(&mut self, start: Pfn, end: Pfn) -> Result<(), BanError> {
        let (mut start, mut end) = (start.as_u64(), end.as_u64());
        if start > end {
            return Err(BanError::InvalidRange);
        }
        if self.frozen {
            kdebug!("PRAM: ignoring ban of {start:x}-{end:x} during reservation");
            return Ok(());
        }

        let regions = self.regions.as_slice();

        // Walk down from the last region while it could still touch the
        // range; `lo` ends up at the first region that stays in front of it.
        let mut lo = regions.len();
        let mut merged_hi = None;
        while lo > 0 && start <= regions[lo - 1].end.saturating_add(1) {
            let region = regions[lo - 1];
            if end.saturating_add(1) >= region.start {
                start = start.min(region.start);
                end = end.max(region.end);
                merged_hi.get_or_insert(lo - 1);
            } else {
                // Sorted and disjoint: once merging began, every earlier
                // region must either merge too or end the scan.
                debug_assert!(merged_hi.is_none(), "banned regions out of order");
            }
            lo -= 1;
        }

        let combined = BannedRegion { start, end };
        let tail = merged_hi.map_or(lo, |hi| hi + 1);
        if merged_hi.is_none() && self.regions.is_full() {
            kerr!("PRAM: Failed to ban {start:x}-{end:x}: Too many banned regions");
            return Err(BanError::CapacityExceeded);
        }

        let mut next = ArrayVec::new();
        for region in regions[..lo]
            .iter()
            .chain(core::iter::once(&combined))
            .chain(&regions[tail..])
        {
            // Never more than the current length plus one, checked above.
            if next.try_push(*region).is_err() {
                return Err(BanError::CapacityExceeded);
            }
        }
        self.regions = next;
        Ok(())
    }

    /// Returns `true` if `pfn` lies in a banned region.
    #[must_use]
    pub fn is_banned(&self, pfn: Pfn) -> bool {
        let pfn = pfn.as_u64();
        self.regions
            .as_slice()
            .binary_search_by(|region| {
                if region.end < pfn {
                    Ordering::Less
                } else if region.start > pfn {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Stops accepting bans until [`thaw`](Self::thaw).
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Accepts bans again.
    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    /// Returns `true` while bans are being ignored.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The regions, in ascending order.
    #[must_use]
    pub fn regions(&self) -> &[BannedRegion] {
        self.regions.as_slice()
    }

    /// Region count and total banned frames.
    #[must_use]
    pub fn summary(&self) -> BannedSummary {
        BannedSummary {
            regions: self.regions.len(),
            pages: self.regions.iter().map(BannedRegion::pages).sum(),
        }
    }

    /// Logs every region and the totals.
    pub fn log_summary(&self) {
        kinfo!("PRAM: banned regions:");
        for (i, region) in self.regions.iter().enumerate() {
            kinfo!(
                "{i:4}: [{:08x} - {:08x}] {} pages",
                region.start,
                region.end,
                region.pages()
            );
        }
        let summary = self.summary();
        kinfo!(
            "PRAM: Total banned: {} pages in {} regions",
            summary.pages,
            summary.regions
        );
    }
}
