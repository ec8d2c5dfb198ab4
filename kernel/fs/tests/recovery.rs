//! End-to-end recovery: write a store into a memory image, reserve it,
//! mount it, inspect the result.

#![allow(missing_docs)]

use pram_core::PAGE_SIZE;
use pram_core::cmdline::PramParams;
use pram_core::image::{ImageWriter, RamImage};
use pram_core::layout::{ExtentEntry, ExtentFlags, FileHeadRecord, ROOT_LEN_MAX, S_IFREG};
use pram_core::Pfn;
use pram_fs::{InodeKind, LoadReport, PageFlags, mount};
use pram_mm::{Memblock, PramContext, ReserveError};

fn boot(image: RamImage, root: Pfn) -> (PramContext, Memblock, Result<u64, ReserveError>) {
    let cmdline = format!("console=ttyS0 pram={root:x}");
    let mut ctx = PramContext::new(&PramParams::parse(Some(&cmdline)));
    let mut mb = Memblock::new(image, ctx.banned());
    let result = ctx.reserve(&mut mb);
    (ctx, mb, result)
}

// ── Single file ───────────────────────────────────────────────────────

#[test]
fn sparse_two_page_file() {
    let mut writer = ImageWriter::new(16);
    writer
        .add_sparse_file("a.txt", S_IFREG | 0o644, 2, &[(0, 0)])
        .unwrap();
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, reserved) = boot(image, root);
    // root + head + node + one data page.
    assert_eq!(reserved, Ok(4));

    let mounted = mount(&mut ctx, &mut mb);
    let fs = &mounted.fs;
    let file = fs.lookup(fs.root(), "a.txt").unwrap();
    let stat = fs.stat(file).unwrap();
    assert_eq!(stat.kind, InodeKind::File);
    assert_eq!(stat.size, 2 * PAGE_SIZE as u64);
    assert_eq!(stat.mode, S_IFREG | 0o644);

    let page = fs.page(file, 0).unwrap().unwrap();
    assert_eq!(page.flags, PageFlags::UPTODATE | PageFlags::DIRTY);
    assert_eq!(fs.page(file, 1), Ok(None));

    assert_eq!(
        mounted.report,
        LoadReport {
            files_loaded: 1,
            files_failed: 0,
            pages_attached: 1,
            pages_leaked: 0,
        }
    );
    assert_eq!(ctx.root(), None);
    assert_eq!(ctx.reserved_pages(), 0);
    // Frame 0 and the adopted data page.
    assert_eq!(mb.owned_frames(), 2);
}

#[test]
fn order_three_extent_fills_eight_positions() {
    let mut writer = ImageWriter::new(32);
    writer
        .add_sparse_file("big", S_IFREG | 0o600, 50, &[(42, 3)])
        .unwrap();
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, reserved) = boot(image, root);
    assert_eq!(reserved, Ok(11));

    let mounted = mount(&mut ctx, &mut mb);
    let file = mounted.fs.lookup(mounted.fs.root(), "big").unwrap();
    let indexes: Vec<u64> = mounted
        .fs
        .cached_pages(file)
        .unwrap()
        .map(|(index, _)| index)
        .collect();
    assert_eq!(indexes, (42..=49).collect::<Vec<_>>());

    let first = mounted.fs.page(file, 42).unwrap().unwrap().pfn;
    let last = mounted.fs.page(file, 49).unwrap().unwrap().pfn;
    assert_eq!(last, first.add(7));
}

#[test]
fn contents_read_back() {
    let text = b"persistent memory survives the reboot\n".repeat(300);
    let mut writer = ImageWriter::new(64);
    writer.add_file("log.txt", S_IFREG | 0o644, &text).unwrap();
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, reserved) = boot(image, root);
    assert!(reserved.is_ok());
    let mounted = mount(&mut ctx, &mut mb);
    let file = mounted.fs.resolve("/log.txt").unwrap();

    let mut buf = vec![0; text.len()];
    assert_eq!(mounted.fs.read(&mb, file, 0, &mut buf), Ok(text.len()));
    assert_eq!(buf, text);
}

// ── Failures ──────────────────────────────────────────────────────────

#[test]
fn second_node_corrupted_after_reservation() {
    let mut writer = ImageWriter::new(32);
    writer.add_file("first", S_IFREG | 0o644, &[0x11; 2 * PAGE_SIZE]).unwrap();
    let second = writer.add_file("second", S_IFREG | 0o644, &[0x22; PAGE_SIZE]).unwrap();
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, reserved) = boot(image, root);
    assert_eq!(reserved, Ok(8));

    let node = FileHeadRecord::decode(mb.image().page(second).unwrap(), second)
        .unwrap()
        .first_node;
    mb.image_mut().page_mut(node).unwrap()[24] ^= 0x01;

    let mounted = mount(&mut ctx, &mut mb);
    let fs = &mounted.fs;
    let first = fs.lookup(fs.root(), "first").unwrap();
    assert!(fs.page(first, 0).unwrap().is_some());
    assert!(fs.page(first, 1).unwrap().is_some());
    assert!(fs.lookup(fs.root(), "second").is_err());

    assert_eq!(mounted.report.files_loaded, 1);
    assert_eq!(mounted.report.files_failed, 1);
    // head + node + data of the rejected file.
    assert_eq!(mounted.report.pages_leaked, 3);
    assert_eq!(ctx.reserved_pages(), 3);
}

#[test]
fn corrupt_head_reserves_nothing() {
    let mut writer = ImageWriter::new(32);
    writer.add_file("one", S_IFREG, &[1; PAGE_SIZE]).unwrap();
    writer.add_file("two", S_IFREG, &[2; PAGE_SIZE]).unwrap();
    let third = writer.add_file("three", S_IFREG, &[3; PAGE_SIZE]).unwrap();
    let (mut image, root) = writer.finish().unwrap();
    image.page_mut(third).unwrap()[12] ^= 0xff;

    let (mut ctx, mut mb, reserved) = boot(image, root);
    assert!(matches!(reserved, Err(ReserveError::Corrupt(_))));
    assert_eq!(ctx.reserved_pages(), 0);
    assert_eq!(ctx.root(), None);
    assert_eq!(mb.owned_frames(), 1);

    let mounted = mount(&mut ctx, &mut mb);
    assert!(mounted.fs.readdir(mounted.fs.root()).unwrap().is_empty());
    assert_eq!(mounted.report, LoadReport::default());
}

#[test]
fn banned_data_page_aborts_reservation() {
    let mut writer = ImageWriter::new(32);
    writer.add_file("a", S_IFREG, &[9; 4 * PAGE_SIZE]).unwrap();
    let (image, root) = writer.finish().unwrap();

    let mut ctx = PramContext::with_root(root);
    ctx.banned_mut().ban(Pfn::new(3), Pfn::new(3)).unwrap();
    let baseline = Memblock::new(image.clone(), ctx.banned()).owned_frames();
    let mut mb = Memblock::new(image, ctx.banned());

    assert_eq!(
        ctx.reserve(&mut mb),
        Err(ReserveError::Conflict {
            pfn: Pfn::new(1),
            order: 2
        })
    );
    assert_eq!(mb.owned_frames(), baseline);
}

#[test]
fn extent_past_memory_aborts_reservation() {
    let mut writer = ImageWriter::new(8);
    let entries = [ExtentEntry {
        flags: ExtentFlags::new(2, 0).unwrap(),
        pfn: Pfn::new(6),
    }];
    writer
        .add_file_with_extents("tail", S_IFREG, 4, &entries)
        .unwrap();
    let (image, root) = writer.finish().unwrap();

    let (ctx, mb, reserved) = boot(image, root);
    assert_eq!(reserved, Err(ReserveError::InvalidFrame(Pfn::new(6))));
    assert_eq!(ctx.reserved_pages(), 0);
    assert_eq!(mb.owned_frames(), 1);
}

// ── Shape of the store ────────────────────────────────────────────────

#[test]
fn root_list_spanning_two_blocks() {
    let files = ROOT_LEN_MAX + 3;
    let mut writer = ImageWriter::new(files + 8);
    for i in 0..files {
        writer.add_file(&format!("f{i:04}"), S_IFREG, &[]).unwrap();
    }
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, reserved) = boot(image, root);
    assert_eq!(reserved, Ok(files as u64 + 2));

    let mounted = mount(&mut ctx, &mut mb);
    assert_eq!(mounted.report.files_loaded, files);
    assert_eq!(mounted.fs.readdir(mounted.fs.root()).unwrap().len(), files);
    assert_eq!(mb.owned_frames(), 1);
}

#[test]
fn duplicate_names_keep_the_first() {
    let mut writer = ImageWriter::new(32);
    writer.add_file("same", S_IFREG, b"one").unwrap();
    writer.add_file("same", S_IFREG, b"two").unwrap();
    let (image, root) = writer.finish().unwrap();

    let (mut ctx, mut mb, _) = boot(image, root);
    let mounted = mount(&mut ctx, &mut mb);
    assert_eq!(mounted.report.files_loaded, 1);
    assert_eq!(mounted.report.files_failed, 1);

    let file = mounted.fs.lookup(mounted.fs.root(), "same").unwrap();
    let mut buf = [0; 3];
    mounted.fs.read(&mb, file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"one");
}

#[test]
fn no_parameter_means_no_store() {
    let mut ctx = PramContext::new(&PramParams::parse(Some("quiet splash")));
    let mut mb = Memblock::new(RamImage::zeroed(8), ctx.banned());
    assert_eq!(ctx.reserve(&mut mb), Ok(0));
    let mounted = mount(&mut ctx, &mut mb);
    assert_eq!(mounted.report, LoadReport::default());
}
