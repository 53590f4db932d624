//! Command-line interface definitions for muon.

use std::path::PathBuf;

use clap::Parser;

/// Static system image builder.
#[derive(Parser)]
#[command(name = "muon", version, about)]
pub struct Cli {
    /// Path to the system description XML.
    pub system: PathBuf,

    /// Output image path.
    #[arg(short, long, default_value = "loader.img")]
    pub output: PathBuf,

    /// Allocation report path.
    #[arg(short, long, default_value = "report.txt")]
    pub report: PathBuf,

    /// Board name (a directory under the SDK's board/).
    #[arg(long)]
    pub board: String,

    /// Configuration name (a directory under the chosen board).
    #[arg(long)]
    pub config: String,

    /// Extra directories searched for program images. The current working
    /// directory is always searched first.
    #[arg(long = "search-path")]
    pub search_paths: Vec<PathBuf>,

    /// Suppress progress output.
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Enable verbose output with sizing-loop diagnostics.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
