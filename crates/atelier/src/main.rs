//! Atelier: change-feed sync runner
//!
//! Main binary with subcommands:
//! - `watch`: Bulk load, then follow the change feed until Ctrl-C
//! - `snapshot`: Bulk load once and print the filtered views
//! - `replay`: Apply a snapshot file and an event log offline

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_sync::SyncConfig;

mod replay;
mod report;
mod watch;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Realtime cache sync for Atelier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the backing store lives and how to authenticate.
#[derive(Args, Clone)]
pub struct Connection {
    /// Project URL (REST reads go to `<url>/rest/v1`)
    #[arg(long, env = "ATELIER_URL")]
    pub url: String,

    /// Anonymous API key
    #[arg(long, env = "ATELIER_API_KEY")]
    pub api_key: String,

    /// User access token, for row-level security
    #[arg(long, env = "ATELIER_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Realtime URL, if it differs from the project URL
    #[arg(long, env = "ATELIER_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Rows per snapshot page
    #[arg(long, env = "ATELIER_PAGE_SIZE")]
    pub page_size: Option<usize>,

    /// JSON file with session tunables
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Connection {
    /// Load the session config, with command-line overrides applied.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    miette::miette!("failed to read config {}: {}", path.display(), e)
                })?;
                serde_json::from_str(&text)
                    .map_err(|e| miette::miette!("invalid config {}: {}", path.display(), e))?
            }
            None => SyncConfig::default(),
        };
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        config.validate().map_err(|e| miette::miette!("{}", e))?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk load every collection, then apply live changes until Ctrl-C
    Watch {
        #[command(flatten)]
        connection: Connection,
    },

    /// Bulk load every collection once and print the filtered views as JSON
    Snapshot {
        #[command(flatten)]
        connection: Connection,
    },

    /// Apply a snapshot and an event log offline and print the filtered views
    Replay {
        /// JSON object mapping table names to row arrays
        #[arg(long, value_name = "FILE")]
        snapshot: PathBuf,

        /// Change events, one JSON object per line
        #[arg(long, value_name = "FILE")]
        events: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON output stays clean.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "atelier=info,atelier_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { connection } => watch::run(&connection).await,
        Commands::Snapshot { connection } => watch::snapshot(&connection).await,
        Commands::Replay { snapshot, events } => {
            let store = replay::run_files(&snapshot, &events)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            report::print(&store)
        }
    }
}
