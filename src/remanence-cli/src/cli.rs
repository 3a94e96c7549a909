//! CLI definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "remanence")]
#[command(about = "Inspect kernel file objects in a raw memory snapshot")]
#[command(version)]
pub struct Cli {
    /// Raw physical memory image
    #[arg(short, long, global = true)]
    pub image: Option<PathBuf>,

    /// TOML sidecar describing the image (defaults to <image>.toml)
    #[arg(short, long, global = true)]
    pub meta: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which per-process structure a scan walks.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScanVia {
    /// Handle-table entries
    Handles,
    /// VAD tree mappings
    Vad,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the object map and show population statistics
    Info,

    /// Discover file objects and list them
    Scan {
        /// Scan a single process instead of the whole system
        #[arg(short, long)]
        pid: Option<u32>,

        /// Candidate source for per-process scans
        #[arg(long, value_enum, default_value = "handles")]
        via: ScanVia,

        /// Maximum number of objects to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Emit the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconstruct one object and print its summary
    Lookup {
        /// Virtual address of the object body (hex or decimal)
        address: String,
    },

    /// List the synthetic entries an object exposes
    Ls {
        /// Virtual address of the object body (hex or decimal)
        address: String,
    },

    /// Stream one synthetic entry to stdout or a file
    Cat {
        /// Virtual address of the object body (hex or decimal)
        address: String,

        /// Entry name ("data" or "info.txt")
        #[arg(short, long, default_value = "data")]
        entry: String,

        /// Byte offset to start from
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Bytes to read (defaults to the rest of the entry)
        #[arg(short, long)]
        length: Option<u64>,

        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Hex-dump recovered file content at an object address
    Read {
        /// Virtual address of the object body (hex or decimal)
        address: String,

        /// Byte offset to start from
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Bytes to dump
        #[arg(short, long, default_value = "256")]
        length: usize,
    },
}
