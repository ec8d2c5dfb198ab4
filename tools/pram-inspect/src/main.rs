//! Host tool for persistent RAM images.
//!
//! `pack` plays the kernel that wrote the store before rebooting: it lays
//! host files out in a memory image. `inspect` plays the kernel that boots
//! afterwards: it reserves the store, mounts it and reports what survived.

mod cli;
mod inspect;
mod logger;
mod pack;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logger::init(cli.verbose);

    match cli.command {
        cli::Command::Pack(ref args) => pack::run(args),
        cli::Command::Inspect(ref args) => inspect::run(args),
    }
}
