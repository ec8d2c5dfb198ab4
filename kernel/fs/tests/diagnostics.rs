//! Log output of the recovery passes.
//!
//! Lives in its own test binary: the log sink is process-wide.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Mutex;

use pram_core::PAGE_SIZE;
use pram_core::image::ImageWriter;
use pram_core::layout::S_IFREG;
use pram_core::log::{self, LogLevel};
use pram_fs::mount;
use pram_mm::{Memblock, PramContext};

static LINES: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

fn capture(level: LogLevel, args: fmt::Arguments<'_>) {
    if let Ok(mut lines) = LINES.lock() {
        lines.push((level, args.to_string()));
    }
}

fn take_lines() -> Vec<(LogLevel, String)> {
    std::mem::take(&mut *LINES.lock().unwrap())
}

fn has(lines: &[(LogLevel, String)], level: LogLevel, needle: &str) -> bool {
    lines
        .iter()
        .any(|(l, line)| *l == level && line.contains(needle))
}

#[test]
fn recovery_reports_through_the_sink() {
    // SAFETY: `capture` only locks a mutex.
    unsafe { log::set_log_fn(capture) };

    // Successful pass: banned summary, reserved total and load report.
    let mut writer = ImageWriter::new(16);
    writer.add_file("ok", S_IFREG, &[1; PAGE_SIZE]).unwrap();
    let (image, root) = writer.finish().unwrap();
    let mut ctx = PramContext::with_root(root);
    ctx.banned_mut()
        .ban(pram_core::Pfn::new(14), pram_core::Pfn::new(15))
        .unwrap();
    ctx.banned().log_summary();
    let mut mb = Memblock::new(image, ctx.banned());
    ctx.reserve(&mut mb).unwrap();
    let mounted = mount(&mut ctx, &mut mb);
    assert_eq!(mounted.report.files_loaded, 1);

    let lines = take_lines();
    assert!(has(&lines, LogLevel::Info, "Total banned: 2 pages in 1 regions"));
    assert!(has(&lines, LogLevel::Info, "PRAM: 4 pages reserved"));
    assert!(has(&lines, LogLevel::Info, "1 files loaded"));

    // Failing pass: the bad block with expected and found checksums, then
    // the rollback.
    let mut writer = ImageWriter::new(16);
    let head = writer.add_file("bad", S_IFREG, &[2; PAGE_SIZE]).unwrap();
    let (mut image, root) = writer.finish().unwrap();
    image.page_mut(head).unwrap()[30] ^= 0x40;
    let mut ctx = PramContext::with_root(root);
    let mut mb = Memblock::new(image, ctx.banned());
    assert!(ctx.reserve(&mut mb).is_err());

    let lines = take_lines();
    assert!(has(&lines, LogLevel::Error, &format!("head pfn:{head:x} corrupted")));
    assert!(has(&lines, LogLevel::Error, "PRAM: Reservation failed"));

    log::clear_log_fn();
}
