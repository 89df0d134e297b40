//! oncocache - command line front end for the services catalog cache.
//!
//! Reads go through the persistent cache exactly as an interactive client
//! would: fresh entries are served locally, stale ones are shown and then
//! revalidated, misses are fetched. The management commands mirror the
//! cache panel (status, enable/disable, clear, sweep, force revalidation).

mod commands;
mod view;

use std::io;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oncocache_core::Config;

#[derive(Parser, Debug)]
#[command(name = "oncocache", version, about = "Cached access to the oncology services catalog")]
struct Cli {
    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListArgs {
    /// services, patients, protocols or preauthorizations
    pub collection: String,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = oncocache_core::cache::key::DEFAULT_PAGE_SIZE)]
    pub page_size: u32,
    #[arg(long, default_value = oncocache_core::cache::key::DEFAULT_SORT_FIELD)]
    pub sort: String,
    #[arg(long)]
    pub desc: bool,
    #[arg(long)]
    pub search: Option<String>,
    #[arg(long)]
    pub search_type: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List one page of a collection through the cache
    List(ListArgs),
    /// Bypass the cache for one read, then store the fresh page
    Revalidate(ListArgs),
    /// Load the full service catalog through the chunked cache
    Catalog {
        /// Only print the row count
        #[arg(long)]
        count: bool,
    },
    /// Show dropdown options (all kinds when omitted)
    Options { kind: Option<String> },
    /// Create a record from a JSON object
    Create { collection: String, record: String },
    /// Update a record from a JSON object with an id, patching cached copies
    Update { collection: String, record: String },
    /// Delete a record by id
    Delete { collection: String, id: String },
    /// Search as you type: each line read from stdin replaces the search term
    Search {
        #[command(flatten)]
        list: ListArgs,
    },
    /// Re-check the active page whenever focus returns (simulated on a timer)
    Watch {
        #[command(flatten)]
        list: ListArgs,
        /// Seconds between simulated focus events
        #[arg(long, default_value_t = 60)]
        every: u64,
        /// Number of focus events before exiting
        #[arg(long, default_value_t = 10)]
        ticks: u32,
    },
    /// Show cache statistics
    Status,
    /// Enable caching
    Enable,
    /// Disable caching; reads always go to the server
    Disable,
    /// Remove cached entries (everything when no collection is given)
    Clear { collection: Option<String> },
    /// Remove expired, corrupt and outdated entries
    Sweep,
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr unless a log directory is configured, in which case
/// they go to a daily file there. The returned guard must outlive logging.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "oncocache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load()?;
    let _guard = init_tracing(config.log_dir.as_deref());
    info!(api_url = %config.api_url, "oncocache starting");

    commands::run(cli.command, config, cli.json).await
}
