//! Filesystem side of persistent RAM recovery.
//!
//! After [`pram_mm`] has reserved a store, [`load::load_tree`] walks it a
//! second time and rebuilds every file it describes inside a [`Namespace`],
//! handing the data pages over without copying them. [`RamFs`] is the
//! in-memory namespace the store is mounted as; [`mount::mount`] glues the
//! two together.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod load;
pub mod mount;
pub mod ramfs;

use core::fmt;

use pram_core::Pfn;

pub use load::{LoadError, LoadReport, load_tree};
pub use mount::{Mounted, mount};
pub use ramfs::{CachedPage, DirEntry, InodeId, InodeKind, PageFlags, RamFs, Stat};

/// Errors returned by namespace operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The inode or name does not exist.
    NotFound,
    /// The name or page position is already taken.
    AlreadyExists,
    /// A directory operation was applied to a non-directory.
    NotADirectory,
    /// A file operation was applied to a directory.
    IsADirectory,
    /// An argument is malformed.
    InvalidArgument,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::IsADirectory => f.write_str("is a directory"),
            Self::InvalidArgument => f.write_str("invalid argument"),
        }
    }
}

impl core::error::Error for FsError {}

/// Where recovered files are created.
///
/// Implementations take ownership of every page passed to
/// [`attach_page`](Self::attach_page); the caller stops accounting for it
/// as soon as the call succeeds.
pub trait Namespace {
    /// Handle to a directory.
    type Dir;
    /// Handle to a regular file.
    type File;

    /// Creates an empty regular file of `size` bytes named `name` in
    /// `parent`.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`] if the name is taken, or any error the
    /// implementation reports for a bad parent, name or mode.
    fn create_regular_file(
        &mut self,
        parent: &Self::Dir,
        name: &str,
        mode: u32,
        size: u64,
    ) -> Result<Self::File, FsError>;

    /// Places frame `pfn` at logical page `index` of `file`, up to date and
    /// dirty.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`] if the position is already populated.
    /// The page is not taken on error.
    fn attach_page(&mut self, file: &Self::File, index: u64, pfn: Pfn) -> Result<(), FsError>;
}
