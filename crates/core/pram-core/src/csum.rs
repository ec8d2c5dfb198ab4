//! Metadata block integrity.
//!
//! Every metadata block starts with an 8-byte header: a `u32` magic followed
//! by a `u32` checksum. The checksum is a CRC-32 over the rest of the page,
//! so the header itself is never covered.

use core::fmt;

use crate::frame::{Page, Pfn};
use crate::kerr;
use crate::layout::{BlockKind, read_u32, write_u32};

/// Length of the magic + checksum header excluded from the checksum.
pub const HEADER_LEN: usize = 8;

const MAGIC_OFFSET: usize = 0;
const CSUM_OFFSET: usize = 4;

/// Computes the checksum of a metadata block.
#[must_use]
pub fn checksum(block: &Page) -> u32 {
    crc32fast::hash(&block[HEADER_LEN..])
}

/// Returns the magic stored in a block header.
#[must_use]
pub fn stored_magic(block: &Page) -> u32 {
    read_u32(block, MAGIC_OFFSET)
}

/// Returns the checksum stored in a block header.
#[must_use]
pub fn stored_checksum(block: &Page) -> u32 {
    read_u32(block, CSUM_OFFSET)
}

/// Stamps `kind`'s magic and a fresh checksum into the block header.
///
/// The body must be final; any later write invalidates the block.
pub fn seal(block: &mut Page, kind: BlockKind) {
    write_u32(block, MAGIC_OFFSET, kind.magic());
    let csum = checksum(block);
    write_u32(block, CSUM_OFFSET, csum);
}

/// Checks a block's magic and checksum.
///
/// # Errors
///
/// Returns [`Corruption`] on a magic or checksum mismatch. The failure is
/// logged with the frame number and the expected and found values.
pub fn verify(block: &Page, pfn: Pfn, kind: BlockKind) -> Result<(), Corruption> {
    let magic = stored_magic(block);
    if magic != kind.magic() {
        let err = Corruption {
            kind,
            pfn,
            fault: Fault::Magic { found: magic },
        };
        kerr!("PRAM: {err}");
        return Err(err);
    }

    let stored = stored_checksum(block);
    let computed = checksum(block);
    if stored != computed {
        let err = Corruption {
            kind,
            pfn,
            fault: Fault::Checksum { stored, computed },
        };
        kerr!("PRAM: {err}");
        return Err(err);
    }
    Ok(())
}

/// What was wrong with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The header carries another block kind's magic, or garbage.
    Magic {
        /// Magic found in the header.
        found: u32,
    },
    /// The stored checksum does not match the block contents.
    Checksum {
        /// Checksum stored in the header.
        stored: u32,
        /// Checksum computed over the block.
        computed: u32,
    },
    /// The entry count does not fit in the page.
    Length {
        /// Entry count stored in the block.
        len: u32,
        /// Largest count that fits.
        max: usize,
    },
}

/// A metadata block failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    /// Kind of block that was expected at `pfn`.
    pub kind: BlockKind,
    /// Frame the block lives in.
    pub pfn: Pfn,
    /// The failed check.
    pub fault: Fault,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, pfn) = (self.kind.name(), self.pfn);
        match self.fault {
            Fault::Magic { found } => write!(
                f,
                "{kind} pfn:{pfn:x} corrupted: bad magic, expected {:x}, found {found:x}",
                self.kind.magic()
            ),
            Fault::Checksum { stored, computed } => write!(
                f,
                "{kind} pfn:{pfn:x} corrupted: expected {stored:x}, found {computed:x}"
            ),
            Fault::Length { len, max } => {
                write!(f, "{kind} pfn:{pfn:x} corrupted: {len} entries, at most {max} fit")
            }
        }
    }
}

impl core::error::Error for Corruption {}
