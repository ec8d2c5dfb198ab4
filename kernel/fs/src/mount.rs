//! Mounting a recovered store.

use pram_core::kinfo;
use pram_mm::{PageReserver, PramContext};

use crate::load::{LoadReport, load_tree};
use crate::ramfs::RamFs;

/// A freshly mounted filesystem and what went into it.
#[derive(Debug)]
pub struct Mounted {
    /// The filesystem; empty if there was nothing to recover.
    pub fs: RamFs,
    /// Outcome of reconstruction.
    pub report: LoadReport,
}

/// Creates an empty [`RamFs`] and, if `ctx` holds a reservation, rebuilds
/// the store into its root directory.
///
/// Always succeeds; recovery problems only show up in the report.
pub fn mount<A: PageReserver + ?Sized>(ctx: &mut PramContext, alloc: &mut A) -> Mounted {
    let mut fs = RamFs::new();
    let root = fs.root();
    let report = if ctx.has_reservation() {
        load_tree(ctx, alloc, &mut fs, &root)
    } else {
        kinfo!("PRAM: mounting empty filesystem");
        ctx.clear_root();
        LoadReport::default()
    };
    Mounted { fs, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pram_core::image::{ImageWriter, RamImage};
    use pram_core::layout::S_IFREG;
    use pram_mm::Memblock;

    #[test]
    fn mount_without_store_is_empty() {
        let mut ctx = PramContext::default();
        let mut mb = Memblock::new(RamImage::zeroed(4), ctx.banned());
        let mounted = mount(&mut ctx, &mut mb);
        assert!(mounted.fs.readdir(mounted.fs.root()).unwrap().is_empty());
        assert_eq!(mounted.report, LoadReport::default());
    }

    #[test]
    fn mount_after_failed_reservation_is_empty() {
        let mut writer = ImageWriter::new(16);
        let head = writer.add_file("x", S_IFREG, b"x").unwrap();
        let (mut image, root) = writer.finish().unwrap();
        image.page_mut(head).unwrap()[40] ^= 1;

        let mut ctx = PramContext::with_root(root);
        let mut mb = Memblock::new(image, ctx.banned());
        assert!(ctx.reserve(&mut mb).is_err());
        let mounted = mount(&mut ctx, &mut mb);
        assert!(mounted.fs.readdir(mounted.fs.root()).unwrap().is_empty());
        assert_eq!(mb.owned_frames(), 1);
    }
}
