//! `pram-inspect pack`: lay host files out as a persistent store.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use pram_core::image::{ImageWriter, RamImage};
use pram_core::layout::S_IFREG;
use pram_core::{PAGE_SIZE, Pfn};

use crate::cli::PackArgs;

/// Permission bits to record for a packed file.
#[cfg(unix)]
fn permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Writes every file in `files` into a fresh image of `frames` frames.
///
/// Returns the image and the frame of its first root block.
pub fn build_image<P: AsRef<Path>>(
    frames: usize,
    first_frame: Pfn,
    files: &[P],
) -> Result<(RamImage, Pfn)> {
    let mut writer = ImageWriter::with_first_frame(frames, first_frame);
    for path in files {
        let path = path.as_ref();
        let meta = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
        let contents = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no UTF-8 file name", path.display()))?;

        let head = writer
            .add_file(name, S_IFREG | permissions(&meta), &contents)
            .with_context(|| format!("adding {}", path.display()))?;
        println!(
            "  {name}: head pfn:{head:x}, {} bytes in {} pages",
            contents.len(),
            contents.len().div_ceil(PAGE_SIZE)
        );
    }
    writer.finish().context("writing the root list")
}

/// Runs the `pack` subcommand.
pub fn run(args: &PackArgs) -> Result<()> {
    let (image, root) = build_image(args.frames, args.first_frame, &args.files)?;
    fs::write(&args.output, image.as_bytes())
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "Wrote {} ({} frames); boot with pram={root:x}",
        args.output.display(),
        image.frames()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pram_core::layout::{FileHeadRecord, RootRecord};

    #[test]
    fn packs_host_files() {
        let dir = std::env::temp_dir().join(format!("pram-pack-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let a = dir.join("a.txt");
        let b = dir.join("b.bin");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, vec![7u8; PAGE_SIZE * 2]).unwrap();

        let (image, root) = build_image(64, Pfn::new(8), &[&a, &b]).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        let record = RootRecord::decode(image.page(root).unwrap(), root).unwrap();
        assert_eq!(record.files.len(), 2);
        assert!(record.files.iter().all(|pfn| pfn.as_u64() >= 8));
        let head = record.files[1];
        let head = FileHeadRecord::decode(image.page(head).unwrap(), head).unwrap();
        assert_eq!(head.name(), Ok("b.bin"));
        assert_eq!(head.page_count, 2);
        assert!(head.is_regular());
    }
}
