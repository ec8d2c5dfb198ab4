//! Stderr sink for the recovery log.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use pram_core::log::{self, LogLevel};

/// Most verbose level printed, set once at startup.
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Maps the `-v` count to the most verbose level shown.
pub fn level_for(verbose: u8) -> LogLevel {
    match verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

fn stderr_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level as u8 <= MAX_LEVEL.load(Ordering::Relaxed) {
        eprintln!("[{}] {args}", level.name());
    }
}

/// Installs the stderr sink.
pub fn init(verbose: u8) {
    MAX_LEVEL.store(level_for(verbose) as u8, Ordering::Relaxed);
    // SAFETY: `stderr_log` only writes to stderr, which is always usable.
    unsafe { log::set_log_fn(stderr_log) };
}
