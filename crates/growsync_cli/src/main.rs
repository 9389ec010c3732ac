//! growsync CLI
//!
//! Operator tools for server store snapshots.
//!
//! # Commands
//!
//! - `inspect` - Show per-entity row and tombstone counts
//! - `prune` - Drop tombstones past the retention window
//! - `check-conflict` - Settle a delete-vs-modify conflict on one row
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// growsync command-line tools.
#[derive(Parser)]
#[command(name = "growsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the server snapshot file
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
    /// Show per-entity row and tombstone counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drop tombstones older than the retention window
    Prune {
        /// Retention window in days
        #[arg(short, long, default_value = "30")]
        days: u64,

        /// Dry run - show what would be done
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Settle a delete-vs-modify conflict on one row
    CheckConflict {
        /// Entity (table) name
        #[arg(short, long)]
        table: String,

        /// Row id
        #[arg(short, long)]
        id: uuid::Uuid,

        /// Watermark of the requesting client, in epoch milliseconds
        #[arg(short, long, default_value = "0")]
        last_pulled_at: i64,

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
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Snapshot path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Prune { days, dry_run } => {
            let path = cli.path.ok_or("Snapshot path required for prune")?;
            commands::prune::run(&path, days, dry_run)?;
        }
        Commands::CheckConflict {
            table,
            id,
            last_pulled_at,
            format,
        } => {
            let path = cli.path.ok_or("Snapshot path required for check-conflict")?;
            commands::check_conflict::run(&path, &table, id, last_pulled_at, &format)?;
        }
        Commands::Version => {
            println!("growsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("entities: {}", growsync_protocol::EntityKind::ALL.len());
        }
    }

    Ok(())
}
