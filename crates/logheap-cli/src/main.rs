//! # Logheap CLI
//!
//! Command-line interface for the Logheap log indexer.
//!
//! ## Commands
//!
//! - `logheap ingest` - Index new bytes of the configured log files
//! - `logheap query <query>` - Search indexed messages
//! - `logheap queries` - List recorded queries
//! - `logheap results <id>` - Page through the results of a recorded query
//! - `logheap maintain` - Correct tails, merge segments, collect garbage
//! - `logheap serve` - Ingest and maintain periodically until Ctrl+C or stdin EOF
//! - `logheap status` - Show index statistics
//! - `logheap clear` - Delete all index data
//!
//! ## Example Usage
//!
//! ```bash
//! # Index the files listed in the config
//! logheap ingest
//!
//! # Messages mentioning a timeout but no retry, from March on
//! logheap query 'timeout !retry' --from 2024-03-01
//!
//! # Case-sensitive regex
//! logheap query '~~"ERR[0-9]+"'
//! ```

mod app;
mod commands;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logheap - indexed search over growing log files
#[derive(Parser)]
#[command(name = "logheap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "LOGHEAP_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index new bytes of the configured log files
    Ingest {
        /// Glob patterns to ingest in addition to the configured ones
        #[arg(short, long)]
        files: Vec<String>,
    },

    /// Search indexed messages
    #[command(alias = "q")]
    Query {
        /// Query text: words, "quoted strings", ~regex, ~~case-sensitive regex,
        /// combined with AND, OR, ! and parentheses
        query: String,

        /// Only messages dated at or after this (RFC 3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD")
        #[arg(long, value_parser = parse_date_bound)]
        from: Option<DateTime<Utc>>,

        /// Only messages dated at or before this
        #[arg(long, value_parser = parse_date_bound)]
        to: Option<DateTime<Utc>>,

        /// Stop after this many results
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// List recorded queries
    Queries,

    /// Show the stored results of a query
    Results {
        /// Query id
        id: u64,

        /// Results to skip
        #[arg(short, long, default_value = "0")]
        skip: usize,

        /// Maximum number of results to show
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Correct tail messages, merge small segments and collect garbage
    Maintain,

    /// Ingest and maintain periodically until stopped
    Serve {
        /// Stop after this many ingestion cycles
        #[arg(long)]
        cycles: Option<usize>,

        /// Keep running when stdin is closed (for use without a terminal)
        #[arg(long)]
        ignore_stdin: bool,
    },

    /// Show index status and statistics
    Status,

    /// Clear the index and all data
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Parse a `--from`/`--to` bound. Dates without an offset are UTC.
fn parse_date_bound(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("Unrecognized date: {}", s))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => logheap_core::Config::load_from(path)?,
        None => logheap_core::Config::load()?,
    };

    // Execute command
    match cli.command {
        Commands::Ingest { files } => commands::ingest::run(config, files),
        Commands::Query {
            query,
            from,
            to,
            limit,
            output,
        } => commands::query::run(config, &query, from, to, limit, output),
        Commands::Queries => commands::queries::run(config),
        Commands::Results {
            id,
            skip,
            limit,
            output,
        } => commands::results::run(config, id, skip, limit, output),
        Commands::Maintain => commands::maintain::run(config),
        Commands::Serve {
            cycles,
            ignore_stdin,
        } => commands::serve::run(config, cycles, ignore_stdin),
        Commands::Status => commands::status::run(config),
        Commands::Clear { yes } => commands::clear::run(config, yes),
    }
}
