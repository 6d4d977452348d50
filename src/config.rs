//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the prelinker using `clap`.

use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;

/// Default first load address for KEXTs when no prelinked kernel is given.
pub const DEFAULT_BASE_ADDRESS: u64 = 0xffff_ff7f_8000_0000;

fn parse_address(text: &str) -> Result<u64, ParseIntError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16)
}

/// Prelinks x86_64 kernel extensions.
///
/// Each bundle is linked against its declared libraries, which may be other
/// bundles on the command line or KEXTs already inside a prelinked kernel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// KEXT bundle directories
    #[arg(required = true, num_args = 1..)]
    pub bundles: Vec<PathBuf>,

    /// Prelinked kernel providing the kernel and already linked KEXTs
    #[arg(short, long)]
    pub kernel: Option<PathBuf>,

    /// First load address, in hex (defaults past the prelinked KEXTs)
    #[arg(long, value_parser = parse_address)]
    pub base_address: Option<u64>,

    /// Output directory
    #[arg(short, long, default_value = ".", help = "Directory receiving the linked executables")]
    pub output: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}
