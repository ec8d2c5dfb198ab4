//! Command-line interface definitions for pram-inspect.

use std::fmt;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use pram_core::Pfn;

/// Build and inspect persistent RAM memory images.
#[derive(Parser)]
#[command(name = "pram-inspect", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Increase log output (repeat for more: info, debug, trace).
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Write host files into a new memory image as a persistent store.
    Pack(PackArgs),
    /// Recover the store in a memory image and show what comes back.
    Inspect(InspectArgs),
}

/// Arguments for the `pack` subcommand.
#[derive(Parser)]
pub struct PackArgs {
    /// Image file to create.
    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Image size in 4 KiB frames.
    #[arg(long, default_value_t = 1024)]
    pub frames: usize,

    /// First frame the store may occupy (hex).
    #[arg(long, value_parser = parse_frame, default_value = "1")]
    pub first_frame: Pfn,

    /// Files to store, flattened to their base names.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Arguments for the `inspect` subcommand.
#[derive(Parser)]
pub struct InspectArgs {
    /// Memory image to recover from.
    #[arg(long, short = 'i')]
    pub image: PathBuf,

    /// Frame of the first root block (hex).
    #[arg(long, value_parser = parse_frame, conflicts_with = "cmdline")]
    pub pram: Option<Pfn>,

    /// Kernel command line to take `pram=` from.
    #[arg(long)]
    pub cmdline: Option<String>,

    /// Ban an inclusive frame range before reserving, as `start-end` (hex).
    #[arg(long = "ban", value_parser = parse_range)]
    pub bans: Vec<FrameRange>,

    /// Copy recovered files into this directory.
    #[arg(long)]
    pub extract: Option<PathBuf>,
}

/// An inclusive frame range given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    /// First frame.
    pub start: Pfn,
    /// Last frame (inclusive).
    pub end: Pfn,
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.start, self.end)
    }
}

fn parse_frame(s: &str) -> Result<Pfn, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map(Pfn::new)
        .map_err(|e| format!("invalid hex frame '{s}': {e}"))
}

fn parse_range(s: &str) -> Result<FrameRange, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected start-end, got '{s}'"))?;
    let range = FrameRange {
        start: parse_frame(start)?,
        end: parse_frame(end)?,
    };
    if range.start > range.end {
        return Err(format!("range {range} ends before it starts"));
    }
    Ok(range)
}
