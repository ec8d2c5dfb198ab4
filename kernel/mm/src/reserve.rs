//! The reservation pass.
//!
//! Walks root list -> file heads -> node lists -> extents. Every block is
//! verified before any frame number read from it is used, then its own page
//! is claimed, then whatever it references. Each level hands back a token
//! recording exactly what it claimed; when a level fails it releases its own
//! partial claims in reverse order and the caller releases the tokens it
//! already holds, so a failure anywhere leaves nothing claimed.

use alloc::vec::Vec;

use pram_core::csum::Corruption;
use pram_core::layout::{ExtentEntry, FileHeadRecord, FileNodeRecord, RootRecord};
use pram_core::{Page, Pfn, kdebug, kerr, ktrace};

use crate::{PageReserver, RangeError, ReserveError};

/// Claims held for one node block: its own page plus its extents.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ReservedNode {
    pfn: Pfn,
    extents: Vec<ExtentEntry>,
}

impl ReservedNode {
    /// Frame of the node block.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Extents claimed for this node, in on-media order.
    pub fn extents(&self) -> &[ExtentEntry] {
        &self.extents
    }

    /// Pages held, the node's own page included.
    pub fn pages(&self) -> u64 {
        1 + self.extents.iter().map(ExtentEntry::pages).sum::<u64>()
    }
}

/// Claims held for one file: its head page and every node of its chain.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ReservedFile {
    head: Pfn,
    nodes: Vec<ReservedNode>,
}

impl ReservedFile {
    /// Frame of the file head block.
    pub fn head(&self) -> Pfn {
        self.head
    }

    /// Claimed nodes in chain order.
    pub fn nodes(&self) -> &[ReservedNode] {
        &self.nodes
    }

    /// Pages held, the head page included.
    pub fn pages(&self) -> u64 {
        1 + self.nodes.iter().map(ReservedNode::pages).sum::<u64>()
    }
}

/// Claims held for one root block and the files it references.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ReservedRoot {
    pfn: Pfn,
    files: Vec<ReservedFile>,
}

impl ReservedRoot {
    /// Frame of the root block.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Claimed files in root-block order.
    pub fn files(&self) -> &[ReservedFile] {
        &self.files
    }

    /// Pages held, the root page included.
    pub fn pages(&self) -> u64 {
        1 + self.files.iter().map(ReservedFile::pages).sum::<u64>()
    }
}

/// Everything a successful reservation pass claimed.
///
/// Holding one is proof that the whole chain verified and is owned; the
/// reconstruction pass consumes it.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct ReservedChain {
    first: Pfn,
    roots: Vec<ReservedRoot>,
}

impl ReservedChain {
    /// Frame of the first root block.
    pub fn first(&self) -> Pfn {
        self.first
    }

    /// Claimed root blocks in chain order.
    pub fn roots(&self) -> &[ReservedRoot] {
        &self.roots
    }

    /// Iterates over every claimed file in chain order.
    pub fn files(&self) -> impl Iterator<Item = &ReservedFile> {
        self.roots.iter().flat_map(|root| root.files.iter())
    }

    /// Total pages held.
    pub fn pages(&self) -> u64 {
        self.roots.iter().map(ReservedRoot::pages).sum()
    }
}

/// Drives one reservation pass against a page allocator.
///
/// `reserved_pages` is the running counter; after any public call returns
/// it equals the pages held by all outstanding tokens.
pub struct Reserver<'a, A: PageReserver + ?Sized> {
    alloc: &'a mut A,
    reserved_pages: &'a mut u64,
}

impl<'a, A: PageReserver + ?Sized> Reserver<'a, A> {
    /// Creates a reserver claiming from `alloc` and counting into
    /// `reserved_pages`.
    pub fn new(alloc: &'a mut A, reserved_pages: &'a mut u64) -> Self {
        Self {
            alloc,
            reserved_pages,
        }
    }

    /// Reads and decodes the block at `pfn` without claiming it.
    fn read<T>(
        &self,
        pfn: Pfn,
        decode: impl FnOnce(&Page, Pfn) -> Result<T, Corruption>,
    ) -> Result<T, ReserveError> {
        let page = match pfn.non_null() {
            Some(pfn) if pfn < self.alloc.frame_limit() => self.alloc.translate(pfn),
            _ => None,
        };
        let Some(page) = page else {
            kerr!("PRAM: pfn:{pfn:x} invalid");
            return Err(ReserveError::InvalidFrame(pfn));
        };
        Ok(decode(page, pfn)?)
    }

    /// Claims the `2^order` frames starting at `pfn`.
    ///
    /// # Errors
    ///
    /// [`ReserveError::InvalidFrame`] if the range is not inside usable
    /// memory (frame 0 never is), [`ReserveError::Conflict`] if any frame in
    /// it is already owned.
    pub fn reserve_extent(&mut self, pfn: Pfn, order: u32) -> Result<(), ReserveError> {
        let count = match 1u64.checked_shl(order) {
            Some(count) if !pfn.is_none() && pfn.range_below(count, self.alloc.frame_limit()) => count,
            _ => {
                kerr!("PRAM: pfn:{pfn:x} order {order} invalid");
                return Err(ReserveError::InvalidFrame(pfn));
            }
        };

        match self.alloc.reserve_range(pfn, count) {
            Ok(()) => {
                *self.reserved_pages += count;
                ktrace!("PRAM: reserved pfn:{pfn:x} order {order}");
                Ok(())
            }
            Err(RangeError::OutOfRange) => Err(ReserveError::InvalidFrame(pfn)),
            Err(RangeError::Busy) => {
                kerr!("PRAM: pfn:{pfn:x} order {order} busy");
                Err(ReserveError::Conflict { pfn, order })
            }
        }
    }

    /// Releases an extent claimed with [`reserve_extent`](Self::reserve_extent).
    pub fn unreserve_extent(&mut self, pfn: Pfn, order: u32) {
        let count = 1u64 << order;
        self.alloc.release_range(pfn, count);
        debug_assert!(*self.reserved_pages >= count, "reservation counter underflow");
        *self.reserved_pages -= count;
    }

    /// Verifies and claims one node block and all of its extents.
    ///
    /// Returns the claims and the next node frame.
    fn reserve_node(&mut self, pfn: Pfn) -> Result<(ReservedNode, Pfn), ReserveError> {
        let record = self.read(pfn, FileNodeRecord::decode)?;
        self.reserve_extent(pfn, 0)?;

        let mut node = ReservedNode {
            pfn,
            extents: Vec::with_capacity(record.entries.len()),
        };
        for entry in record.entries {
            if let Err(err) = self.reserve_extent(entry.pfn, entry.order()) {
                self.release_node(node);
                return Err(err);
            }
            node.extents.push(entry);
        }
        Ok((node, record.next))
    }

    /// Verifies and claims a file: its head block, then every node of its
    /// chain together with the node's extents.
    ///
    /// # Errors
    ///
    /// Any failure in the file's chain. Everything claimed for the file up
    /// to that point has been released again.
    pub fn reserve_file(&mut self, head: Pfn) -> Result<ReservedFile, ReserveError> {
        let record = self.read(head, FileHeadRecord::decode)?;
        self.reserve_extent(head, 0)?;

        let mut file = ReservedFile {
            head,
            nodes: Vec::new(),
        };
        let mut next = record.first_node;
        while let Some(pfn) = next.non_null() {
            match self.reserve_node(pfn) {
                Ok((node, following)) => {
                    file.nodes.push(node);
                    next = following;
                }
                Err(err) => {
                    self.release_file(file);
                    return Err(err);
                }
            }
        }

        kdebug!("PRAM: file head pfn:{head:x} reserved, {} pages", file.pages());
        Ok(file)
    }

    /// Verifies and claims one root block and every file it references.
    ///
    /// Returns the claims and the next root frame.
    ///
    /// # Errors
    ///
    /// Any failure in the block or its files. Everything claimed for this
    /// block has been released again.
    pub fn reserve_root(&mut self, pfn: Pfn) -> Result<(ReservedRoot, Pfn), ReserveError> {
        let record = self.read(pfn, RootRecord::decode)?;
        self.reserve_extent(pfn, 0)?;

        let mut root = ReservedRoot {
            pfn,
            files: Vec::with_capacity(record.files.len()),
        };
        for head in record.files {
            match self.reserve_file(head) {
                Ok(file) => root.files.push(file),
                Err(err) => {
                    self.release_root(root);
                    return Err(err);
                }
            }
        }
        Ok((root, record.next))
    }

    /// Claims the whole root list starting at `first`.
    ///
    /// # Errors
    ///
    /// The first failure anywhere in the chain. Nothing stays claimed.
    pub fn reserve_root_chain(&mut self, first: Pfn) -> Result<ReservedChain, ReserveError> {
        let mut chain = ReservedChain {
            first,
            roots: Vec::new(),
        };
        let mut next = first;
        while let Some(pfn) = next.non_null() {
            match self.reserve_root(pfn) {
                Ok((root, following)) => {
                    chain.roots.push(root);
                    next = following;
                }
                Err(err) => {
                    self.release_chain(chain);
                    return Err(err);
                }
            }
        }
        Ok(chain)
    }

    /// Releases a node's extents in reverse order, then its page.
    pub fn release_node(&mut self, node: ReservedNode) {
        for entry in node.extents.iter().rev() {
            self.unreserve_extent(entry.pfn, entry.order());
        }
        self.unreserve_extent(node.pfn, 0);
    }

    /// Releases a file's nodes in reverse order, then its head page.
    pub fn release_file(&mut self, file: ReservedFile) {
        for node in file.nodes.into_iter().rev() {
            self.release_node(node);
        }
        self.unreserve_extent(file.head, 0);
    }

    /// Releases a root block's files in reverse order, then its page.
    pub fn release_root(&mut self, root: ReservedRoot) {
        for file in root.files.into_iter().rev() {
            self.release_file(file);
        }
        self.unreserve_extent(root.pfn, 0);
    }

    /// Releases every root block of a chain, last first.
    pub fn release_chain(&mut self, chain: ReservedChain) {
        for root in chain.roots.into_iter().rev() {
            self.release_root(root);
        }
    }
}
