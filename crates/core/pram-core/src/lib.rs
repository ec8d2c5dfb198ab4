//! Core library for persistent RAM (PRAM) recovery.
//!
//! Holds everything both recovery passes agree on: frame numbers, the
//! on-media block layout, the integrity checksum, the banned-region table,
//! boot parameters, and the log facility. [`image`] provides a host-side
//! builder for memory images in the same format.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod banned;
pub mod cmdline;
pub mod csum;
pub mod frame;
pub mod image;
pub mod layout;
pub mod log;

pub use frame::{PAGE_SHIFT, PAGE_SIZE, Page, Pfn};
