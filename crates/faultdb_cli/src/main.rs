//! faultdb CLI
//!
//! Command-line tools for faultdb store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display store metadata and row counts
//! - `verify` - Verify journal integrity
//! - `compact` - Rewrite the journal with live rows only
//! - `dump` - Dump journal frames for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// faultdb command-line store tools.
#[derive(Parser)]
#[command(name = "faultdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store metadata and row counts
    Inspect {
        /// Show per-entity row counts
        #[arg(short, long)]
        entities: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify,

    /// Rewrite the journal with live rows only
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump journal frames for debugging
    Dump {
        /// Maximum number of frames to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this commit sequence
        #[arg(short, long, default_value = "0")]
        sequence: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { entities, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, entities, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Dump {
            limit,
            sequence,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump")?;
            commands::dump::run(&path, limit, sequence, &format)?;
        }
        Commands::Version => {
            println!("faultdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("faultdb core v{}", faultdb_core::VERSION);
        }
    }

    Ok(())
}
