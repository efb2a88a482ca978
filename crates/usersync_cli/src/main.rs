//! usersync CLI
//!
//! Command-line tools for looking at the state a usersync client
//! persisted.
//!
//! # Commands
//!
//! - `inspect` - Show the persisted user and a summary of every store
//! - `dump-queue` - Print pending operations in queue order

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Inspect persisted usersync state.
#[derive(Parser)]
#[command(name = "usersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the preference file
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
    /// Show the persisted user and store summaries
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print pending operations in queue order
    DumpQueue {
        /// Maximum number of operations to print
        #[arg(short, long)]
        limit: Option<usize>,

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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Preference file path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpQueue { limit, format } => {
            let path = cli.path.ok_or("Preference file path required for dump-queue")?;
            commands::dump_queue::run(&path, limit, &format)?;
        }
        Commands::Version => {
            println!("usersync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
