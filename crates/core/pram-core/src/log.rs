//! Leveled logging for the recovery passes.
//!
//! The recovery code runs before any logger exists, so output goes through a
//! single registered [`LogFn`]. Until [`set_log_fn`] is called, messages are
//! discarded. Use the convenience macros (`kerr!`, `kinfo!`, ...) rather than
//! calling [`_log`] directly.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Log severity level, lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Something failed; recovery degrades but continues.
    Error = 1,
    /// Unexpected condition that was tolerated.
    Warn = 2,
    /// Progress and summaries.
    Info = 3,
    /// Per-block diagnostics.
    Debug = 4,
    /// Per-page diagnostics.
    Trace = 5,
}

impl LogLevel {
    /// Returns the fixed-width level name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// The signature of the registered log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the log sink.
///
/// # Safety
///
/// `f` must be callable from any context the recovery passes run in. It may
/// be replaced later; `Release` ordering publishes the new sink.
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Restores the discarding sink.
pub fn clear_log_fn() {
    LOG_FN.store(null_log as *mut (), Ordering::Release);
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: only `LogFn` pointers are ever stored into LOG_FN.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    load_log_fn()(level, args);
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Trace);
        assert_eq!(LogLevel::Warn.name().len(), LogLevel::Debug.name().len());
    }

    #[test]
    fn unregistered_sink_discards() {
        // Must not crash with the default sink in place.
        kinfo!("PRAM: nothing listens {}", 1);
    }
}
