//! In-memory filesystem whose file data lives in adopted page frames.
//!
//! `RamFs` keeps its tree in a flat inode table. A regular file has no data
//! buffer of its own: its contents are a sparse page cache mapping logical
//! page indexes to frames, which is how recovered pages are taken over
//! without a copy. Positions with no page read as zeros.

use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use pram_core::layout::{S_IFMT, S_IFREG};
use pram_core::{PAGE_SIZE, Pfn};
use pram_mm::PageReserver;

use crate::{FsError, Namespace};

/// Directory type bits of a POSIX mode.
const S_IFDIR: u32 = 0o040_000;

/// Identifies an inode within one [`RamFs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(u64);

impl InodeId {
    /// Returns the raw inode number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inode type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

bitflags::bitflags! {
    /// State of a page in a file's page cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Page contents are valid.
        const UPTODATE = 1 << 0;
        /// Page contents exist nowhere else.
        const DIRTY    = 1 << 1;
    }
}

/// A frame in a file's page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPage {
    /// Backing frame.
    pub pfn: Pfn,
    /// Cache state.
    pub flags: PageFlags,
}

/// Inode attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Inode type.
    pub kind: InodeKind,
    /// POSIX mode, type bits included.
    pub mode: u32,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Number of populated page positions.
    pub cached_pages: usize,
}

/// A directory entry returned by [`RamFs::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Inode the entry refers to.
    pub inode: InodeId,
    /// Type of that inode.
    pub kind: InodeKind,
}

#[derive(Debug)]
struct RamInode {
    kind: InodeKind,
    mode: u32,
    size: u64,
    /// Child entries (directories only).
    children: BTreeMap<String, InodeId>,
    /// Page cache (files only).
    pages: BTreeMap<u64, CachedPage>,
}

impl RamInode {
    fn new(kind: InodeKind, mode: u32, size: u64) -> Self {
        Self {
            kind,
            mode,
            size,
            children: BTreeMap::new(),
            pages: BTreeMap::new(),
        }
    }
}

/// A ramfs filesystem instance.
#[derive(Debug)]
pub struct RamFs {
    inodes: BTreeMap<InodeId, RamInode>,
    next_id: u64,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

impl RamFs {
    /// The root directory.
    pub const ROOT: InodeId = InodeId(1);

    /// Creates a filesystem with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(
            Self::ROOT,
            RamInode::new(InodeKind::Directory, S_IFDIR | 0o755, 0),
        );
        Self {
            inodes,
            next_id: Self::ROOT.0 + 1,
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> InodeId {
        Self::ROOT
    }

    fn inode(&self, id: InodeId) -> Result<&RamInode, FsError> {
        self.inodes.get(&id).ok_or(FsError::NotFound)
    }

    fn dir(&self, id: InodeId) -> Result<&RamInode, FsError> {
        let inode = self.inode(id)?;
        if inode.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    fn file(&self, id: InodeId) -> Result<&RamInode, FsError> {
        let inode = self.inode(id)?;
        if inode.kind != InodeKind::File {
            return Err(FsError::IsADirectory);
        }
        Ok(inode)
    }

    fn insert(&mut self, parent: InodeId, name: &str, inode: RamInode) -> Result<InodeId, FsError> {
        check_name(name)?;
        let id = InodeId(self.next_id);
        let dir = self.inodes.get_mut(&parent).ok_or(FsError::NotFound)?;
        if dir.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        match dir.children.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(FsError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        self.inodes.insert(id, inode);
        self.next_id += 1;
        Ok(id)
    }

    /// Creates an empty directory.
    ///
    /// # Errors
    ///
    /// Fails if `parent` is not a directory, the name is unusable or taken.
    pub fn create_dir(&mut self, parent: InodeId, name: &str, perms: u32) -> Result<InodeId, FsError> {
        let mode = S_IFDIR | (perms & !S_IFMT);
        self.insert(parent, name, RamInode::new(InodeKind::Directory, mode, 0))
    }

    /// Looks `name` up in directory `dir`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] or [`FsError::NotFound`].
    pub fn lookup(&self, dir: InodeId, name: &str) -> Result<InodeId, FsError> {
        self.dir(dir)?
            .children
            .get(name)
            .copied()
            .ok_or(FsError::NotFound)
    }

    /// Resolves a `/`-separated path from the root.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidArgument`] for `..` components, otherwise whatever
    /// [`lookup`](Self::lookup) reports on the way.
    pub fn resolve(&self, path: &str) -> Result<InodeId, FsError> {
        let mut current = Self::ROOT;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if component == ".." {
                return Err(FsError::InvalidArgument);
            }
            current = self.lookup(current, component)?;
        }
        Ok(current)
    }

    /// Returns the attributes of `id`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for an unknown inode.
    pub fn stat(&self, id: InodeId) -> Result<Stat, FsError> {
        let inode = self.inode(id)?;
        Ok(Stat {
            kind: inode.kind,
            mode: inode.mode,
            size: inode.size,
            cached_pages: inode.pages.len(),
        })
    }

    /// Lists directory `dir` in name order.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] or [`FsError::NotFound`].
    pub fn readdir(&self, dir: InodeId) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.dir(dir)?;
        dir.children
            .iter()
            .map(|(name, &inode)| {
                Ok(DirEntry {
                    name: name.clone(),
                    inode,
                    kind: self.inode(inode)?.kind,
                })
            })
            .collect()
    }

    /// The page cached at logical `index` of `file`, if any.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] or [`FsError::NotFound`].
    pub fn page(&self, file: InodeId, index: u64) -> Result<Option<CachedPage>, FsError> {
        Ok(self.file(file)?.pages.get(&index).copied())
    }

    /// All cached pages of `file` in index order.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] or [`FsError::NotFound`].
    pub fn cached_pages(
        &self,
        file: InodeId,
    ) -> Result<impl Iterator<Item = (u64, CachedPage)> + '_, FsError> {
        Ok(self.file(file)?.pages.iter().map(|(&index, &page)| (index, page)))
    }

    /// Reads from `file` at byte `offset`, fetching page contents through
    /// `mem`. Returns the number of bytes read, 0 at or past end of file.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`], [`FsError::NotFound`] for an unknown inode
    /// or a cached frame `mem` cannot translate.
    pub fn read<A: PageReserver + ?Sized>(
        &self,
        mem: &A,
        file: InodeId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let inode = self.file(file)?;
        if offset >= inode.size {
            return Ok(0);
        }
        let len = usize::try_from(inode.size - offset).map_or(buf.len(), |left| left.min(buf.len()));

        let page_size = PAGE_SIZE as u64;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            // Always below PAGE_SIZE.
            let within = (pos % page_size) as usize;
            let chunk = (PAGE_SIZE - within).min(len - done);
            let dst = &mut buf[done..done + chunk];
            match inode.pages.get(&(pos / page_size)) {
                Some(page) => {
                    let src = mem.translate(page.pfn).ok_or(FsError::NotFound)?;
                    dst.copy_from_slice(&src[within..within + chunk]);
                }
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(len)
    }
}

impl Namespace for RamFs {
    type Dir = InodeId;
    type File = InodeId;

    fn create_regular_file(
        &mut self,
        parent: &InodeId,
        name: &str,
        mode: u32,
        size: u64,
    ) -> Result<InodeId, FsError> {
        if mode & S_IFMT != S_IFREG {
            return Err(FsError::InvalidArgument);
        }
        self.insert(*parent, name, RamInode::new(InodeKind::File, mode, size))
    }

    fn attach_page(&mut self, file: &InodeId, index: u64, pfn: Pfn) -> Result<(), FsError> {
        let inode = self.inodes.get_mut(file).ok_or(FsError::NotFound)?;
        if inode.kind != InodeKind::File {
            return Err(FsError::IsADirectory);
        }
        match inode.pages.entry(index) {
            Entry::Occupied(_) => Err(FsError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(CachedPage {
                    pfn,
                    flags: PageFlags::UPTODATE | PageFlags::DIRTY,
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pram_core::banned::BannedRegions;
    use pram_core::image::RamImage;
    use pram_mm::Memblock;

    #[test]
    fn create_and_lookup() {
        let mut fs = RamFs::new();
        let dir = fs.create_dir(fs.root(), "etc", 0o755).unwrap();
        let file = fs
            .create_regular_file(&dir, "hosts", S_IFREG | 0o644, 100)
            .unwrap();
        assert_eq!(fs.lookup(dir, "hosts"), Ok(file));
        assert_eq!(fs.resolve("/etc/hosts"), Ok(file));
        assert_eq!(fs.resolve("etc/./hosts"), Ok(file));
        assert_eq!(fs.resolve("/etc/../etc"), Err(FsError::InvalidArgument));

        let stat = fs.stat(file).unwrap();
        assert_eq!(stat.kind, InodeKind::File);
        assert_eq!(stat.size, 100);
        assert_eq!(stat.mode, S_IFREG | 0o644);
        assert_eq!(fs.stat(dir).unwrap().mode, S_IFDIR | 0o755);
    }

    #[test]
    fn create_errors() {
        let mut fs = RamFs::new();
        let root = fs.root();
        let file = fs.create_regular_file(&root, "f", S_IFREG, 0).unwrap();
        assert_eq!(
            fs.create_regular_file(&root, "f", S_IFREG, 0),
            Err(FsError::AlreadyExists)
        );
        assert_eq!(
            fs.create_regular_file(&file, "g", S_IFREG, 0),
            Err(FsError::NotADirectory)
        );
        assert_eq!(
            fs.create_regular_file(&root, "d", S_IFDIR, 0),
            Err(FsError::InvalidArgument)
        );
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert_eq!(
                fs.create_regular_file(&root, bad, S_IFREG, 0),
                Err(FsError::InvalidArgument),
                "{bad:?}"
            );
        }
        assert_eq!(fs.lookup(root, "missing"), Err(FsError::NotFound));
    }

    #[test]
    fn attach_marks_page_and_rejects_overlap() {
        let mut fs = RamFs::new();
        let root = fs.root();
        let file = fs.create_regular_file(&root, "f", S_IFREG, 8192).unwrap();
        fs.attach_page(&file, 1, Pfn::new(9)).unwrap();
        assert_eq!(
            fs.attach_page(&file, 1, Pfn::new(10)),
            Err(FsError::AlreadyExists)
        );

        let page = fs.page(file, 1).unwrap().unwrap();
        assert_eq!(page.pfn, Pfn::new(9));
        assert!(page.flags.contains(PageFlags::UPTODATE | PageFlags::DIRTY));
        assert_eq!(fs.page(file, 0), Ok(None));
        assert_eq!(fs.attach_page(&root, 0, Pfn::new(3)), Err(FsError::IsADirectory));
    }

    #[test]
    fn readdir_is_sorted() {
        let mut fs = RamFs::new();
        let root = fs.root();
        fs.create_regular_file(&root, "b", S_IFREG, 0).unwrap();
        fs.create_dir(root, "a", 0o700).unwrap();
        let names: Vec<_> = fs
            .readdir(root)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            [
                ("a".to_string(), InodeKind::Directory),
                ("b".to_string(), InodeKind::File)
            ]
        );
    }

    #[test]
    fn read_spans_pages_and_holes() {
        let mut image = RamImage::zeroed(4);
        image.page_mut(Pfn::new(2)).unwrap().fill(0xab);
        let mem = Memblock::new(image, &BannedRegions::<4>::new());

        let mut fs = RamFs::new();
        let root = fs.root();
        let size = PAGE_SIZE as u64 + 10;
        let file = fs.create_regular_file(&root, "f", S_IFREG, size).unwrap();
        fs.attach_page(&file, 1, Pfn::new(2)).unwrap();

        let mut buf = vec![0xff; 20];
        let n = fs.read(&mem, file, PAGE_SIZE as u64 - 10, &mut buf).unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[..10], &[0; 10]);
        assert_eq!(&buf[10..], &[0xab; 10]);

        let n = fs.read(&mem, file, size - 4, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(fs.read(&mem, file, size, &mut buf), Ok(0));
        assert_eq!(fs.read(&mem, root, 0, &mut buf), Err(FsError::IsADirectory));
    }
}
