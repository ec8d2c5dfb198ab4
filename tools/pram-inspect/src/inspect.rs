//! `pram-inspect inspect`: run both recovery passes over an image.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::Path;

use anyhow::{Context, Result};
use pram_core::PAGE_SIZE;
use pram_core::cmdline::PramParams;
use pram_core::image::RamImage;
use pram_fs::{InodeId, InodeKind, Mounted, RamFs, mount};
use pram_mm::{Memblock, PramContext};

use crate::cli::InspectArgs;

/// Renders the tree under `dir`, one line per inode, children indented.
fn render_tree(ramfs: &RamFs, dir: InodeId, depth: usize, out: &mut String) -> Result<()> {
    for entry in ramfs.readdir(dir)? {
        let stat = ramfs.stat(entry.inode)?;
        let indent = depth * 2;
        match entry.kind {
            InodeKind::Directory => {
                writeln!(out, "{:06o} {:>10} {:>6}  {:indent$}{}/", stat.mode, "-", "-", "", entry.name)?;
                render_tree(ramfs, entry.inode, depth + 1, out)?;
            }
            InodeKind::File => {
                writeln!(
                    out,
                    "{:06o} {:>10} {:>6}  {:indent$}{}",
                    stat.mode, stat.size, stat.cached_pages, "", entry.name
                )?;
            }
        }
    }
    Ok(())
}

/// Streams `file` into `target` one page at a time.
fn extract_file(ramfs: &RamFs, mem: &Memblock, file: InodeId, target: &Path) -> Result<()> {
    let out = File::create(target).with_context(|| format!("creating {}", target.display()))?;
    let mut out = BufWriter::new(out);
    let mut page = [0u8; PAGE_SIZE];
    let mut offset = 0u64;
    loop {
        let read = ramfs.read(mem, file, offset, &mut page)?;
        if read == 0 {
            break;
        }
        out.write_all(&page[..read])
            .with_context(|| format!("writing {}", target.display()))?;
        offset += read as u64;
    }
    out.flush().with_context(|| format!("writing {}", target.display()))
}

/// Copies every recovered file under `dir` into `dest` on the host.
fn extract(ramfs: &RamFs, mem: &Memblock, dir: InodeId, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut count = 0;
    for entry in ramfs.readdir(dir)? {
        let target = dest.join(&entry.name);
        match entry.kind {
            InodeKind::Directory => count += extract(ramfs, mem, entry.inode, &target)?,
            InodeKind::File => {
                extract_file(ramfs, mem, entry.inode, &target)?;
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Reserves and mounts the store in `image`, as boot would.
pub fn recover(
    image: RamImage,
    params: &PramParams,
    args: &InspectArgs,
) -> Result<(PramContext, Memblock, Mounted)> {
    let mut ctx = PramContext::new(params);
    for range in &args.bans {
        ctx.banned_mut()
            .ban(range.start, range.end)
            .with_context(|| format!("banning {range}"))?;
    }
    ctx.banned().log_summary();
    let summary = ctx.banned().summary();
    println!("Banned: {} pages in {} regions", summary.pages, summary.regions);

    let mut mem = Memblock::new(image, ctx.banned());
    match ctx.reserve(&mut mem) {
        Ok(0) => println!("No persistent memory to recover"),
        Ok(pages) => println!("Reserved: {pages} pages"),
        Err(err) => println!("Reservation failed: {err}"),
    }

    let mounted = mount(&mut ctx, &mut mem);
    Ok((ctx, mem, mounted))
}

/// Runs the `inspect` subcommand.
pub fn run(args: &InspectArgs) -> Result<()> {
    let bytes = fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;
    let image = RamImage::from_bytes(bytes)
        .with_context(|| format!("loading {}", args.image.display()))?;

    let params = match args.pram {
        Some(pfn) => PramParams {
            root: pfn.non_null(),
        },
        None => PramParams::parse(args.cmdline.as_deref()),
    };

    let (ctx, mem, mounted) = recover(image, &params, args)?;

    let mut tree = String::new();
    render_tree(&mounted.fs, mounted.fs.root(), 0, &mut tree)?;
    print!("{tree}");
    println!("{}", mounted.report);
    if ctx.reserved_pages() != mounted.report.pages_leaked {
        println!("Warning: {} pages still accounted to the store", ctx.reserved_pages());
    }

    if let Some(dest) = &args.extract {
        let count = extract(&mounted.fs, &mem, mounted.fs.root(), dest)?;
        println!("Extracted {count} files to {}", dest.display());
    }
    Ok(())
}
