//! Host-side memory images.
//!
//! [`RamImage`] is a flat, frame-indexed byte buffer standing in for
//! physical memory that survived a restart. [`ImageWriter`] lays files out in
//! such an image in the on-media format, playing the part of the kernel that
//! wrote the store before rebooting. Tests and the inspection tool use both.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::frame::{PAGE_SIZE, Page, Pfn};
use crate::layout::{
    EncodeError, ExtentEntry, ExtentFlags, FileHeadRecord, FileNodeRecord, NODE_LEN_MAX,
    ROOT_LEN_MAX, RootRecord,
};

/// Errors building or loading a memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The image has no room for `requested` more frames.
    OutOfFrames {
        /// Frames requested by the failed allocation.
        requested: u64,
    },
    /// A byte buffer is not a whole number of pages.
    Misaligned(usize),
    /// The frame is outside the image.
    NoSuchFrame(Pfn),
    /// The file is larger than the format can describe.
    TooLarge,
    /// A record could not be encoded.
    Encode(EncodeError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames { requested } => write!(f, "image full, {requested} frames requested"),
            Self::Misaligned(len) => write!(f, "image length {len} is not a multiple of {PAGE_SIZE}"),
            Self::NoSuchFrame(pfn) => write!(f, "pfn:{pfn:x} is outside the image"),
            Self::TooLarge => f.write_str("file too large for the extent format"),
            Self::Encode(err) => write!(f, "encode failed: {err}"),
        }
    }
}

impl core::error::Error for ImageError {}

impl From<EncodeError> for ImageError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}

/// Frame-indexed physical memory contents.
#[derive(Clone, PartialEq, Eq)]
pub struct RamImage {
    bytes: Vec<u8>,
}

impl fmt::Debug for RamImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamImage")
            .field("frames", &self.frames())
            .finish()
    }
}

impl RamImage {
    /// Creates a zero-filled image of `frames` pages.
    #[must_use]
    pub fn zeroed(frames: usize) -> Self {
        Self {
            bytes: vec![0; frames * PAGE_SIZE],
        }
    }

    /// Wraps raw memory contents.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Misaligned`] unless the length is a whole
    /// number of pages.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.len() % PAGE_SIZE != 0 {
            return Err(ImageError::Misaligned(bytes.len()));
        }
        Ok(Self { bytes })
    }

    /// Number of frames in the image; also the first frame past its end.
    #[must_use]
    pub fn frames(&self) -> u64 {
        (self.bytes.len() / PAGE_SIZE) as u64
    }

    fn byte_range(&self, pfn: Pfn) -> Option<core::ops::Range<usize>> {
        let start = usize::try_from(pfn.as_u64()).ok()?.checked_mul(PAGE_SIZE)?;
        let end = start.checked_add(PAGE_SIZE)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    /// Contents of frame `pfn`, if it exists.
    #[must_use]
    pub fn page(&self, pfn: Pfn) -> Option<&Page> {
        let range = self.byte_range(pfn)?;
        self.bytes[range].try_into().ok()
    }

    /// Mutable contents of frame `pfn`, if it exists.
    pub fn page_mut(&mut self, pfn: Pfn) -> Option<&mut Page> {
        let range = self.byte_range(pfn)?;
        (&mut self.bytes[range]).try_into().ok()
    }

    /// The whole image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the image, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Lays out a persistent store in a [`RamImage`].
///
/// Frames are handed out by a bump pointer. Files are added one at a time;
/// [`finish`](Self::finish) writes the root list referencing them.
#[derive(Debug)]
pub struct ImageWriter {
    image: RamImage,
    next_free: u64,
    files: Vec<Pfn>,
}

impl ImageWriter {
    /// Creates a writer over a zeroed image of `frames` pages. Frame 0 is
    /// never handed out.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self::with_first_frame(frames, Pfn::new(1))
    }

    /// Like [`new`](Self::new), but allocation starts at `first`, leaving
    /// the frames below it untouched.
    #[must_use]
    pub fn with_first_frame(frames: usize, first: Pfn) -> Self {
        Self {
            image: RamImage::zeroed(frames),
            next_free: first.as_u64().max(1),
            files: Vec::new(),
        }
    }

    /// Allocates `count` contiguous frames.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::OutOfFrames`] when the image is exhausted.
    pub fn alloc(&mut self, count: u64) -> Result<Pfn, ImageError> {
        let start = Pfn::new(self.next_free);
        if !start.range_below(count, Pfn::new(self.image.frames())) {
            return Err(ImageError::OutOfFrames { requested: count });
        }
        self.next_free += count;
        Ok(start)
    }

    /// The image being written.
    pub fn image_mut(&mut self) -> &mut RamImage {
        &mut self.image
    }

    fn page_mut(&mut self, pfn: Pfn) -> Result<&mut Page, ImageError> {
        self.image.page_mut(pfn).ok_or(ImageError::NoSuchFrame(pfn))
    }

    /// Writes a sealed root block into `pfn`.
    ///
    /// # Errors
    ///
    /// Fails if the frame is outside the image or the record cannot be encoded.
    pub fn write_root(&mut self, pfn: Pfn, record: &RootRecord) -> Result<(), ImageError> {
        Ok(record.encode(self.page_mut(pfn)?)?)
    }

    /// Writes a sealed file head block into `pfn`.
    ///
    /// # Errors
    ///
    /// Fails if the frame is outside the image or the record cannot be encoded.
    pub fn write_head(&mut self, pfn: Pfn, record: &FileHeadRecord) -> Result<(), ImageError> {
        Ok(record.encode(self.page_mut(pfn)?)?)
    }

    /// Writes a sealed file node block into `pfn`.
    ///
    /// # Errors
    ///
    /// Fails if the frame is outside the image or the record cannot be encoded.
    pub fn write_node(&mut self, pfn: Pfn, record: &FileNodeRecord) -> Result<(), ImageError> {
        Ok(record.encode(self.page_mut(pfn)?)?)
    }

    /// Adds a file holding `contents`, stored densely in power-of-two extents.
    ///
    /// Returns the frame of the file's head block.
    ///
    /// # Errors
    ///
    /// Fails when the image runs out of frames or the file is too large.
    pub fn add_file(&mut self, name: &str, mode: u32, contents: &[u8]) -> Result<Pfn, ImageError> {
        let pages = contents.len().div_ceil(PAGE_SIZE) as u64;
        let page_count = u32::try_from(pages).map_err(|_| ImageError::TooLarge)?;

        let mut entries = Vec::new();
        let mut index = 0u64;
        while index < pages {
            let remaining = pages - index;
            let order = (63 - remaining.leading_zeros()).min(ExtentFlags::MAX_ORDER);
            let count = 1u64 << order;
            let flags = u32::try_from(index)
                .ok()
                .and_then(|index| ExtentFlags::new(order, index))
                .ok_or(ImageError::TooLarge)?;
            let pfn = self.alloc(count)?;
            for sub in 0..count {
                let from = ((index + sub) as usize) * PAGE_SIZE;
                let to = (from + PAGE_SIZE).min(contents.len());
                let page = self.page_mut(pfn.add(sub))?;
                page[..to - from].copy_from_slice(&contents[from..to]);
            }
            entries.push(ExtentEntry { flags, pfn });
            index += count;
        }

        self.add_file_with_extents(name, mode, page_count, &entries)
    }

    /// Adds a file of `page_count` pages whose content is given by
    /// `(index, order)` extents, each backed by freshly allocated zeroed
    /// frames. Positions not covered stay absent.
    ///
    /// # Errors
    ///
    /// Fails when the image runs out of frames or an extent cannot be encoded.
    pub fn add_sparse_file(
        &mut self,
        name: &str,
        mode: u32,
        page_count: u32,
        extents: &[(u32, u32)],
    ) -> Result<Pfn, ImageError> {
        let mut entries = Vec::with_capacity(extents.len());
        for &(index, order) in extents {
            let flags = ExtentFlags::new(order, index).ok_or(ImageError::TooLarge)?;
            let pfn = self.alloc(flags.pages())?;
            entries.push(ExtentEntry { flags, pfn });
        }
        self.add_file_with_extents(name, mode, page_count, &entries)
    }

    /// Adds a file whose extents point at frames the caller already filled.
    ///
    /// # Errors
    ///
    /// Fails when the image runs out of frames or a record cannot be encoded.
    pub fn add_file_with_extents(
        &mut self,
        name: &str,
        mode: u32,
        page_count: u32,
        entries: &[ExtentEntry],
    ) -> Result<Pfn, ImageError> {
        let head = self.alloc(1)?;
        let chunks: Vec<&[ExtentEntry]> = entries.chunks(NODE_LEN_MAX).collect();
        let nodes = self.alloc(chunks.len() as u64)?;

        for (i, chunk) in chunks.iter().enumerate() {
            let next = if i + 1 < chunks.len() {
                nodes.add(i as u64 + 1)
            } else {
                Pfn::NONE
            };
            let record = FileNodeRecord {
                next,
                entries: chunk.to_vec(),
            };
            self.write_node(nodes.add(i as u64), &record)?;
        }

        let first_node = if chunks.is_empty() { Pfn::NONE } else { nodes };
        let record = FileHeadRecord::new(name, mode, page_count, first_node)?;
        self.write_head(head, &record)?;
        self.files.push(head);
        Ok(head)
    }

    /// Writes the root list and returns the image with the frame of its
    /// first root block ([`Pfn::NONE`] if no file was added).
    ///
    /// # Errors
    ///
    /// Fails when the image has no room for the root blocks.
    pub fn finish(mut self) -> Result<(RamImage, Pfn), ImageError> {
        let files = core::mem::take(&mut self.files);
        let chunks: Vec<&[Pfn]> = files.chunks(ROOT_LEN_MAX).collect();
        if chunks.is_empty() {
            return Ok((self.image, Pfn::NONE));
        }

        let roots = self.alloc(chunks.len() as u64)?;
        for (i, chunk) in chunks.iter().enumerate() {
            let next = if i + 1 < chunks.len() {
                roots.add(i as u64 + 1)
            } else {
                Pfn::NONE
            };
            let record = RootRecord {
                next,
                files: chunk.to_vec(),
            };
            self.write_root(roots.add(i as u64), &record)?;
        }
        Ok((self.image, roots))
    }
}
