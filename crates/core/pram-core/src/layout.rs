//! On-media layout of PRAM metadata blocks.
//!
//! Three block kinds, each exactly one page, each starting with the
//! magic + checksum header checked by [`crate::csum`]. All fields are
//! little-endian `u32`.
//!
//! ```text
//! root:  magic | csum | next_root  | len        | file_head[len]
//! head:  magic | csum | page_count | mode       | first_node | name_len | name[255]
//! node:  magic | csum | next_node  | len        | {flags, pfn}[len]
//! ```
//!
//! Blocks are decoded into owned records only after [`crate::csum::verify`]
//! accepted them, so no frame number is read out of an unverified block.

use alloc::vec::Vec;
use core::fmt;

use crate::csum::{self, Corruption, Fault, HEADER_LEN};
use crate::frame::{PAGE_SIZE, Page, Pfn};
use crate::kerr;

/// Magic of a root block (`"PRM2"`).
pub const MAGIC_ROOT: u32 = 0x5052_4D32;
/// Magic of a file head block.
pub const MAGIC_FILE_HEAD: u32 = 0x243F_6A88;
/// Magic of a file node block.
pub const MAGIC_FILE_NODE: u32 = 0x85A3_08D3;

/// Longest file name a head block can carry.
pub const FILE_NAME_MAX: usize = 255;

/// Size of the root and node fixed headers (magic, csum, next, len).
const LIST_HEADER_LEN: usize = 16;

/// Most file references a single root block can hold.
pub const ROOT_LEN_MAX: usize = (PAGE_SIZE - LIST_HEADER_LEN) / 4;

/// Most extent entries a single node block can hold.
pub const NODE_LEN_MAX: usize = (PAGE_SIZE - LIST_HEADER_LEN) / 8;

/// File type mask of a POSIX mode.
pub const S_IFMT: u32 = 0o170_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;

const HEAD_PAGE_COUNT: usize = 8;
const HEAD_MODE: usize = 12;
const HEAD_FIRST_NODE: usize = 16;
const HEAD_NAME_LEN: usize = 20;
const HEAD_NAME: usize = 24;

pub(crate) fn read_u32(block: &Page, offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn write_u32(block: &mut Page, offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_pfn(block: &Page, offset: usize) -> Pfn {
    Pfn::from(read_u32(block, offset))
}

fn encode_pfn(pfn: Pfn) -> Result<u32, EncodeError> {
    u32::try_from(pfn.as_u64()).map_err(|_| EncodeError::FrameOutOfRange(pfn))
}

/// The three metadata block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// One segment of the root list.
    Root,
    /// Per-file header.
    FileHead,
    /// One segment of a file's extent list.
    FileNode,
}

impl BlockKind {
    /// The magic identifying this kind.
    pub const fn magic(self) -> u32 {
        match self {
            Self::Root => MAGIC_ROOT,
            Self::FileHead => MAGIC_FILE_HEAD,
            Self::FileNode => MAGIC_FILE_NODE,
        }
    }

    /// Short name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::FileHead => "head",
            Self::FileNode => "node",
        }
    }
}

fn check_len(kind: BlockKind, pfn: Pfn, len: u32, max: usize) -> Result<usize, Corruption> {
    match usize::try_from(len) {
        Ok(n) if n <= max => Ok(n),
        _ => {
            let err = Corruption {
                kind,
                pfn,
                fault: Fault::Length { len, max },
            };
            kerr!("PRAM: {err}");
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Extent entries
// ---------------------------------------------------------------------------

/// Packed order and logical index of an extent.
///
/// The low 27 bits hold the logical page index inside the file, the high 5
/// bits the extent order (the extent spans `2^order` pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentFlags(u32);

impl ExtentFlags {
    /// Bit position of the order field.
    pub const ORDER_SHIFT: u32 = 27;
    /// Mask of the index field.
    pub const INDEX_MASK: u32 = (1 << Self::ORDER_SHIFT) - 1;
    /// Largest encodable order.
    pub const MAX_ORDER: u32 = 31;

    /// Wraps a raw on-media value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Packs an order and index, or `None` if either does not fit.
    pub const fn new(order: u32, index: u32) -> Option<Self> {
        if order > Self::MAX_ORDER || index > Self::INDEX_MASK {
            return None;
        }
        Some(Self((order << Self::ORDER_SHIFT) | index))
    }

    /// Returns the raw on-media value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// log2 of the extent length in pages.
    pub const fn order(self) -> u32 {
        (self.0 >> Self::ORDER_SHIFT) & 0x1f
    }

    /// Logical page index of the first page of the extent.
    pub const fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    /// Number of pages in the extent.
    pub const fn pages(self) -> u64 {
        1 << self.order()
    }
}

/// One extent: `2^order` physical pages starting at `pfn`, mapped at the
/// logical page index carried in `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentEntry {
    /// Packed order and logical index.
    pub flags: ExtentFlags,
    /// First physical frame of the extent.
    pub pfn: Pfn,
}

impl ExtentEntry {
    /// Extent order.
    pub const fn order(&self) -> u32 {
        self.flags.order()
    }

    /// Logical index of the first page.
    pub const fn index(&self) -> u32 {
        self.flags.index()
    }

    /// Extent length in pages.
    pub const fn pages(&self) -> u64 {
        self.flags.pages()
    }
}

// ---------------------------------------------------------------------------
// Decoded records
// ---------------------------------------------------------------------------

/// A verified root block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    /// Next root block, or [`Pfn::NONE`].
    pub next: Pfn,
    /// File head frames referenced by this block, in order.
    pub files: Vec<Pfn>,
}

impl RootRecord {
    /// Verifies and decodes the root block stored in frame `pfn`.
    ///
    /// # Errors
    ///
    /// Returns [`Corruption`] if the header does not verify or the entry
    /// count overflows the page.
    pub fn decode(block: &Page, pfn: Pfn) -> Result<Self, Corruption> {
        csum::verify(block, pfn, BlockKind::Root)?;
        let len = check_len(BlockKind::Root, pfn, read_u32(block, 12), ROOT_LEN_MAX)?;
        let files = (0..len)
            .map(|i| read_pfn(block, LIST_HEADER_LEN + i * 4))
            .collect();
        Ok(Self {
            next: read_pfn(block, 8),
            files,
        })
    }

    /// Writes this record into `block` and seals it.
    ///
    /// # Errors
    ///
    /// Fails if there are too many files or a frame does not fit in 32 bits.
    pub fn encode(&self, block: &mut Page) -> Result<(), EncodeError> {
        if self.files.len() > ROOT_LEN_MAX {
            return Err(EncodeError::TooManyEntries(self.files.len()));
        }
        block.fill(0);
        write_u32(block, 8, encode_pfn(self.next)?);
        // Bounded by ROOT_LEN_MAX above.
        write_u32(block, 12, self.files.len() as u32);
        for (i, &file) in self.files.iter().enumerate() {
            write_u32(block, LIST_HEADER_LEN + i * 4, encode_pfn(file)?);
        }
        csum::seal(block, BlockKind::Root);
        Ok(())
    }
}

/// Reasons a stored file name cannot become a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    /// `name_len` exceeds [`FILE_NAME_MAX`].
    TooLong(u32),
    /// Empty, `.` or `..`, contains `/` or NUL, or is not UTF-8.
    Invalid,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLong(len) => write!(f, "name length {len} exceeds {FILE_NAME_MAX}"),
            Self::Invalid => f.write_str("invalid file name"),
        }
    }
}

impl core::error::Error for NameError {}

/// A verified file head block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeadRecord {
    /// Logical file length in pages.
    pub page_count: u32,
    /// POSIX mode, including the file type bits.
    pub mode: u32,
    /// First extent node, or [`Pfn::NONE`] for a file without content.
    pub first_node: Pfn,
    /// Stored name length; may exceed [`FILE_NAME_MAX`] on bad media.
    pub name_len: u32,
    name: Vec<u8>,
}

impl FileHeadRecord {
    /// Builds a record for encoding.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::NameTooLong`] for names over [`FILE_NAME_MAX`].
    pub fn new(name: &str, mode: u32, page_count: u32, first_node: Pfn) -> Result<Self, EncodeError> {
        if name.len() > FILE_NAME_MAX {
            return Err(EncodeError::NameTooLong(name.len()));
        }
        Ok(Self {
            page_count,
            mode,
            first_node,
            // Bounded by FILE_NAME_MAX above.
            name_len: name.len() as u32,
            name: name.as_bytes().to_vec(),
        })
    }

    /// Verifies and decodes the file head stored in frame `pfn`.
    ///
    /// The name is not validated here; see [`FileHeadRecord::name`].
    ///
    /// # Errors
    ///
    /// Returns [`Corruption`] if the header does not verify.
    pub fn decode(block: &Page, pfn: Pfn) -> Result<Self, Corruption> {
        csum::verify(block, pfn, BlockKind::FileHead)?;
        let name_len = read_u32(block, HEAD_NAME_LEN);
        let stored = usize::try_from(name_len).map_or(FILE_NAME_MAX, |n| n.min(FILE_NAME_MAX));
        Ok(Self {
            page_count: read_u32(block, HEAD_PAGE_COUNT),
            mode: read_u32(block, HEAD_MODE),
            first_node: read_pfn(block, HEAD_FIRST_NODE),
            name_len,
            name: block[HEAD_NAME..HEAD_NAME + stored].to_vec(),
        })
    }

    /// Writes this record into `block` and seals it.
    ///
    /// # Errors
    ///
    /// Fails if `first_node` does not fit in 32 bits.
    pub fn encode(&self, block: &mut Page) -> Result<(), EncodeError> {
        block.fill(0);
        write_u32(block, HEAD_PAGE_COUNT, self.page_count);
        write_u32(block, HEAD_MODE, self.mode);
        write_u32(block, HEAD_FIRST_NODE, encode_pfn(self.first_node)?);
        write_u32(block, HEAD_NAME_LEN, self.name_len);
        block[HEAD_NAME..HEAD_NAME + self.name.len()].copy_from_slice(&self.name);
        csum::seal(block, BlockKind::FileHead);
        Ok(())
    }

    /// Returns `true` if the mode describes a regular file.
    pub const fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Logical file size in bytes.
    pub const fn size(&self) -> u64 {
        (self.page_count as u64) * PAGE_SIZE as u64
    }

    /// Returns the stored name if it can be used as a directory entry.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] for over-long or unusable names.
    pub fn name(&self) -> Result<&str, NameError> {
        if usize::try_from(self.name_len).map_or(true, |n| n > FILE_NAME_MAX) {
            return Err(NameError::TooLong(self.name_len));
        }
        let name = core::str::from_utf8(&self.name).map_err(|_| NameError::Invalid)?;
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(NameError::Invalid);
        }
        Ok(name)
    }
}

/// A verified file node block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNodeRecord {
    /// Next node of the same file, or [`Pfn::NONE`].
    pub next: Pfn,
    /// Extents described by this node, in order.
    pub entries: Vec<ExtentEntry>,
}

impl FileNodeRecord {
    /// Verifies and decodes the file node stored in frame `pfn`.
    ///
    /// # Errors
    ///
    /// Returns [`Corruption`] if the header does not verify or the entry
    /// count overflows the page.
    pub fn decode(block: &Page, pfn: Pfn) -> Result<Self, Corruption> {
        csum::verify(block, pfn, BlockKind::FileNode)?;
        let len = check_len(BlockKind::FileNode, pfn, read_u32(block, 12), NODE_LEN_MAX)?;
        let entries = (0..len)
            .map(|i| {
                let offset = LIST_HEADER_LEN + i * 8;
                ExtentEntry {
                    flags: ExtentFlags::from_raw(read_u32(block, offset)),
                    pfn: read_pfn(block, offset + 4),
                }
            })
            .collect();
        Ok(Self {
            next: read_pfn(block, 8),
            entries,
        })
    }

    /// Writes this record into `block` and seals it.
    ///
    /// # Errors
    ///
    /// Fails if there are too many entries or a frame does not fit in 32 bits.
    pub fn encode(&self, block: &mut Page) -> Result<(), EncodeError> {
        if self.entries.len() > NODE_LEN_MAX {
            return Err(EncodeError::TooManyEntries(self.entries.len()));
        }
        block.fill(0);
        write_u32(block, 8, encode_pfn(self.next)?);
        // Bounded by NODE_LEN_MAX above.
        write_u32(block, 12, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = LIST_HEADER_LEN + i * 8;
            write_u32(block, offset, entry.flags.raw());
            write_u32(block, offset + 4, encode_pfn(entry.pfn)?);
        }
        csum::seal(block, BlockKind::FileNode);
        Ok(())
    }
}

/// Errors encoding a record into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// A frame number does not fit the 32-bit on-media field.
    FrameOutOfRange(Pfn),
    /// More entries than fit in one page.
    TooManyEntries(usize),
    /// Name longer than [`FILE_NAME_MAX`].
    NameTooLong(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameOutOfRange(pfn) => write!(f, "pfn:{pfn:x} does not fit in 32 bits"),
            Self::TooManyEntries(n) => write!(f, "{n} entries do not fit in one block"),
            Self::NameTooLong(n) => write!(f, "name of {n} bytes exceeds {FILE_NAME_MAX}"),
        }
    }
}

impl core::error::Error for EncodeError {}

// Header fields must stay outside the checksummed range.
const _: () = assert!(HEADER_LEN == 8 && HEAD_NAME + FILE_NAME_MAX <= PAGE_SIZE);
