//! Tessera CLI
//!
//! Command-line tools for Tessera repositories.
//!
//! # Commands
//!
//! - `inspect` - Display partition heads, generations and element counts
//! - `verify` - Verify every region of every partition
//! - `dump` - Dump the blocks of a partition log for debugging
//! - `history` - Show the stored versions of one element
//! - `snapshot` - Start a new generation from the current state
//! - `compact` - Fold history into retention points

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliError, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Tessera command-line repository tools.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the repository directory
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
    /// Display partition heads, generations and element counts
    Inspect {
        /// Only this partition
        #[arg(long)]
        partition: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Verify every region of every partition
    Verify {
        /// Only this partition
        #[arg(long)]
        partition: Option<String>,

        /// Also list regions that passed
        #[arg(short, long)]
        all: bool,
    },

    /// Dump the blocks of a partition log for debugging
    Dump {
        /// Partition to dump
        partition: String,

        /// Generation to dump (defaults to the current one)
        #[arg(short, long)]
        generation: Option<u64>,

        /// Maximum number of blocks to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show the stored versions of one element
    History {
        /// Partition holding the element
        partition: String,

        /// Element id (UUID form)
        element: String,
    },

    /// Start a new generation from the current state
    Snapshot {
        /// Partition to snapshot
        partition: String,
    },

    /// Fold history into retention points
    Compact {
        /// Only this partition
        #[arg(long)]
        partition: Option<String>,

        /// Reference time in milliseconds since the epoch (defaults to now)
        #[arg(long)]
        as_of: Option<i64>,

        /// Show which commits would survive without rewriting anything
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = cli.path;
    let require = |command: &'static str| path.clone().ok_or(CliError::MissingPath(command));

    match cli.command {
        Commands::Inspect { partition, format } => {
            commands::inspect::run(&require("inspect")?, partition.as_deref(), format)
        }
        Commands::Verify { partition, all } => {
            commands::verify::run(&require("verify")?, partition.as_deref(), all)
        }
        Commands::Dump {
            partition,
            generation,
            limit,
            format,
        } => commands::dump::run(&require("dump")?, &partition, generation, limit, format),
        Commands::History { partition, element } => {
            commands::history::run(&require("history")?, &partition, &element)
        }
        Commands::Snapshot { partition } => {
            commands::snapshot::run(&require("snapshot")?, &partition)
        }
        Commands::Compact {
            partition,
            as_of,
            dry_run,
        } => commands::compact::run(&require("compact")?, partition.as_deref(), as_of, dry_run),
        Commands::Version => {
            println!("Tessera CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Tessera Core v{}", tessera_core::VERSION);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
