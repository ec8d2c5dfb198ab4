//! Reconstruction pass: rebuild a reserved store inside a namespace.
//!
//! The walk follows the claims made by the reservation pass and re-verifies
//! every block on the way, since memory may have been scribbled on between
//! the passes. A block whose contents no longer match what was reserved is
//! treated like a corrupt one. Failures are scoped to one file; only a bad
//! root block stops the walk.
//!
//! Page accounting: every data page handed to the namespace and every
//! metadata page given back to the allocator leaves the context's reserved
//! count. Whatever is still counted when the walk ends belongs to files that
//! could not be loaded and is reported as leaked.

use alloc::vec::Vec;
use core::fmt;

use pram_core::csum::Corruption;
use pram_core::layout::{FileHeadRecord, FileNodeRecord, NameError, RootRecord};
use pram_core::{Page, Pfn, kdebug, kerr, kinfo, kwarn};
use pram_mm::{PageReserver, PramContext, ReservedFile, ReservedNode};

use crate::{FsError, Namespace};

/// Why a file was not (fully) loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// A block frame lies outside usable memory.
    InvalidFrame(Pfn),
    /// A block failed its integrity checks.
    Corrupt(Corruption),
    /// A block verifies but no longer describes what was reserved.
    Changed(Pfn),
    /// The head's mode is not a regular file.
    NotRegular(u32),
    /// The head's name length exceeds the maximum.
    NameTooLong(u32),
    /// The name cannot be a directory entry.
    InvalidName,
    /// The namespace refused an operation.
    Namespace(FsError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrame(pfn) => write!(f, "pfn:{pfn:x} invalid"),
            Self::Corrupt(err) => fmt::Display::fmt(err, f),
            Self::Changed(pfn) => write!(f, "pfn:{pfn:x} changed since reservation"),
            Self::NotRegular(mode) => write!(f, "mode {mode:o} is not a regular file"),
            Self::NameTooLong(len) => write!(f, "name length {len} too long"),
            Self::InvalidName => f.write_str("invalid file name"),
            Self::Namespace(err) => write!(f, "namespace: {err}"),
        }
    }
}

impl core::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Corrupt(err) => Some(err),
            Self::Namespace(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Corruption> for LoadError {
    fn from(err: Corruption) -> Self {
        Self::Corrupt(err)
    }
}

impl From<FsError> for LoadError {
    fn from(err: FsError) -> Self {
        Self::Namespace(err)
    }
}

impl From<NameError> for LoadError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::TooLong(len) => Self::NameTooLong(len),
            NameError::Invalid => Self::InvalidName,
        }
    }
}

/// Outcome of a reconstruction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Files created with all of their pages.
    pub files_loaded: usize,
    /// Files skipped or only partially populated.
    pub files_failed: usize,
    /// Data pages now owned by the namespace.
    pub pages_attached: u64,
    /// Pages still reserved for files that could not be loaded.
    pub pages_leaked: u64,
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files loaded, {} failed, {} pages attached, {} pages leaked",
            self.files_loaded, self.files_failed, self.pages_attached, self.pages_leaked
        )
    }
}

fn read_block<A, T>(
    alloc: &A,
    pfn: Pfn,
    decode: impl FnOnce(&Page, Pfn) -> Result<T, Corruption>,
) -> Result<T, LoadError>
where
    A: PageReserver + ?Sized,
{
    let page = match pfn.non_null() {
        Some(pfn) if pfn < alloc.frame_limit() => alloc.translate(pfn),
        _ => None,
    };
    let page = page.ok_or(LoadError::InvalidFrame(pfn))?;
    Ok(decode(page, pfn)?)
}

/// Re-verifies a file's node chain against what was reserved for it.
fn verify_nodes<A: PageReserver + ?Sized>(
    alloc: &A,
    first: Pfn,
    nodes: &[ReservedNode],
) -> Result<(), LoadError> {
    let mut expected = first;
    for node in nodes {
        if node.pfn() != expected {
            return Err(LoadError::Changed(expected));
        }
        let record = read_block(alloc, node.pfn(), FileNodeRecord::decode)?;
        if record.entries != node.extents() {
            return Err(LoadError::Changed(node.pfn()));
        }
        expected = record.next;
    }
    if expected.is_none() {
        Ok(())
    } else {
        Err(LoadError::Changed(expected))
    }
}

/// Hands every page of `file`'s extents over to the namespace.
fn attach_extents<N: Namespace>(
    ctx: &mut PramContext,
    ns: &mut N,
    handle: &N::File,
    file: &ReservedFile,
    attached: &mut u64,
) -> Result<(), LoadError> {
    for entry in file.nodes().iter().flat_map(ReservedNode::extents) {
        let index = u64::from(entry.index());
        for sub in 0..entry.pages() {
            ns.attach_page(handle, index + sub, entry.pfn.add(sub))?;
            ctx.hand_over(1);
            *attached += 1;
        }
    }
    Ok(())
}

/// Returns a created file's head and node pages to the allocator.
fn release_metadata<A: PageReserver + ?Sized>(
    ctx: &mut PramContext,
    alloc: &mut A,
    file: &ReservedFile,
) {
    for node in file.nodes() {
        ctx.release_pages(alloc, node.pfn(), 1);
    }
    ctx.release_pages(alloc, file.head(), 1);
}

fn load_file<A, N>(
    ctx: &mut PramContext,
    alloc: &mut A,
    ns: &mut N,
    parent: &N::Dir,
    file: &ReservedFile,
    attached: &mut u64,
) -> Result<(), LoadError>
where
    A: PageReserver + ?Sized,
    N: Namespace,
{
    let head = read_block(alloc, file.head(), FileHeadRecord::decode)?;
    if !head.is_regular() {
        return Err(LoadError::NotRegular(head.mode));
    }
    let name = head.name()?;
    verify_nodes(alloc, head.first_node, file.nodes())?;

    let handle = ns.create_regular_file(parent, name, head.mode, head.size())?;
    let result = attach_extents(ctx, ns, &handle, file, attached);
    release_metadata(ctx, alloc, file);
    if result.is_ok() {
        kdebug!("PRAM: loaded '{name}', {} pages", head.page_count);
    }
    result
}

/// Rebuilds the reserved store as files in `parent`.
///
/// Consumes the reservation held by `ctx`; without one this does nothing.
/// The store is forgotten afterwards whatever happened. Never fails as a
/// whole: per-file problems are logged and counted in the report.
pub fn load_tree<A, N>(
    ctx: &mut PramContext,
    alloc: &mut A,
    ns: &mut N,
    parent: &N::Dir,
) -> LoadReport
where
    A: PageReserver + ?Sized,
    N: Namespace,
{
    let mut report = LoadReport::default();
    let Some(chain) = ctx.take_reservation() else {
        kdebug!("PRAM: nothing reserved, nothing to load");
        ctx.clear_root();
        return report;
    };

    let mut expected = chain.first();
    for root in chain.roots() {
        let record = if root.pfn() == expected {
            read_block(alloc, root.pfn(), RootRecord::decode)
        } else {
            Err(LoadError::Changed(expected))
        };
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                kerr!("PRAM: root pfn:{:x} rejected, stopping: {err}", root.pfn());
                break;
            }
        };
        let heads: Vec<Pfn> = root.files().iter().map(ReservedFile::head).collect();
        if record.files != heads {
            kerr!("PRAM: root pfn:{:x} changed since reservation, stopping", root.pfn());
            break;
        }

        for file in root.files() {
            match load_file(ctx, alloc, ns, parent, file, &mut report.pages_attached) {
                Ok(()) => report.files_loaded += 1,
                Err(err) => {
                    kwarn!("PRAM: file head pfn:{:x} not loaded: {err}", file.head());
                    report.files_failed += 1;
                }
            }
        }

        expected = record.next;
        ctx.release_pages(alloc, root.pfn(), 1);
    }

    ctx.clear_root();
    report.pages_leaked = ctx.reserved_pages();
    kinfo!("PRAM: {report}");
    report
}
