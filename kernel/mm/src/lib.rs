//! Page reservation for persistent RAM recovery.
//!
//! The first recovery pass: claim every page a persistent store occupies
//! before anything else can allocate it, or claim nothing at all. The pages
//! themselves are owned by a [`PageReserver`]; [`Memblock`] is the
//! bitmap-backed implementation over a host memory image.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod context;
pub mod memblock;
pub mod reserve;

use core::fmt;

use pram_core::csum::Corruption;
use pram_core::{Page, Pfn};

pub use context::PramContext;
pub use memblock::Memblock;
pub use reserve::{ReservedChain, ReservedFile, ReservedNode, ReservedRoot, Reserver};

/// The raw page allocator as seen by the recovery passes.
///
/// Frames are plain integers; nothing is dereferenced without going through
/// [`translate`](Self::translate).
pub trait PageReserver {
    /// First frame past usable memory. Frames at or above it are invalid.
    fn frame_limit(&self) -> Pfn;

    /// Exclusively claims `count` frames starting at `pfn`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::OutOfRange`] if the range leaves usable memory
    /// and [`RangeError::Busy`] if any frame in it is already owned. Nothing
    /// is claimed on error.
    fn reserve_range(&mut self, pfn: Pfn, count: u64) -> Result<(), RangeError>;

    /// Returns a range previously claimed with
    /// [`reserve_range`](Self::reserve_range).
    fn release_range(&mut self, pfn: Pfn, count: u64);

    /// Contents of frame `pfn`, or `None` if it is not backed by memory.
    fn translate(&self, pfn: Pfn) -> Option<&Page>;
}

/// Failure of [`PageReserver::reserve_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The range is not entirely inside usable memory.
    OutOfRange,
    /// A frame in the range is already owned.
    Busy,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("range outside usable memory"),
            Self::Busy => f.write_str("range already reserved"),
        }
    }
}

impl core::error::Error for RangeError {}

/// Why a reservation pass failed. Every variant triggers the same full
/// rollback; they differ only in what gets reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// A frame read from the chain lies outside usable memory.
    InvalidFrame(Pfn),
    /// A metadata block failed its magic, checksum or length check.
    Corrupt(Corruption),
    /// An extent or block overlaps pages that are already owned.
    Conflict {
        /// First frame of the rejected range.
        pfn: Pfn,
        /// Order of the rejected range (0 for metadata blocks).
        order: u32,
    },
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrame(pfn) => write!(f, "pfn:{pfn:x} invalid"),
            Self::Corrupt(err) => fmt::Display::fmt(err, f),
            Self::Conflict { pfn, order } => write!(f, "pfn:{pfn:x} order {order} busy"),
        }
    }
}

impl core::error::Error for ReserveError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Corrupt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Corruption> for ReserveError {
    fn from(err: Corruption) -> Self {
        Self::Corrupt(err)
    }
}
