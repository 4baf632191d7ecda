//! Replog CLI
//!
//! Offline tools for replication changelog directories.
//!
//! # Commands
//!
//! - `inspect` - Display the logs of a changelog with their sizes and keys
//! - `verify` - Check framing, key order and file names of every log file
//! - `dump` - Write every log file as text
//!
//! The commands read the files directly and never take the changelog lock,
//! so they must not be pointed at a changelog a server is writing to when
//! exact results matter.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Replication changelog tools.
#[derive(Parser)]
#[command(name = "replog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the changelog directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display changelog statistics
    Inspect {
        /// Show per-file details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify changelog integrity
    Verify,

    /// Dump every log file as text
    Dump {
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Changelog path required for inspect")?;
            commands::inspect::run(&path, segments, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Changelog path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Dump { output } => {
            let path = cli.path.ok_or("Changelog path required for dump")?;
            commands::dump::run(&path, &output)?;
        }
        Commands::Version => {
            println!("Replog CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
