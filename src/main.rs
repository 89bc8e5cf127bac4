//! # Telegram Warehouse CLI (`tgw`)
//!
//! ## Usage
//!
//! ```bash
//! tgw --config ./config/tgw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tgw init` | Create the warehouse and raw tables |
//! | `tgw scrape` | Fetch new messages for each channel and land them |
//! | `tgw load` | Load landed batches into the warehouse |
//! | `tgw enrich` | Run the detector over downloaded photos |
//! | `tgw load-detections` | Load the detection CSV |
//! | `tgw report` | Rebuild reporting tables and run data checks |
//! | `tgw run` | All of the above, in order |
//! | `tgw checkpoints` | Show per-channel checkpoints |
//! | `tgw stats` | Warehouse overview |
//! | `tgw query ...` | Run an analytical query |
//! | `tgw serve` | Start the query API |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `tg_warehouse=info`). Command results go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tg_warehouse::query::QueryCommand;
use tg_warehouse::{
    config, enrich, fetch, load, load_detections, migrate, pipeline, query, report, server, stats,
};

/// Telegram Warehouse: incremental channel scraping into a queryable warehouse.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tgw.example.toml` for a full example. Source
/// credentials (`TG_API_ID`, `TG_API_HASH`, `TG_PHONE`) are read from the
/// environment or a `.env` file.
#[derive(Parser)]
#[command(
    name = "tgw",
    about = "Telegram Warehouse — scrape channels, load a warehouse, query it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tgw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the warehouse schema. Idempotent.
    Init,

    /// Fetch messages newer than each channel's checkpoint and land them.
    Scrape {
        /// Channel to scrape (repeatable). Defaults to `[scrape].channels`.
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Maximum messages per channel for this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Load every landed batch into the warehouse in one transaction.
    Load,

    /// Run the object detector over downloaded photos and write the CSV.
    Enrich,

    /// Replace the detections table with the contents of the CSV.
    LoadDetections,

    /// Rebuild reporting tables and run data checks.
    Report,

    /// Scrape, load, enrich, load detections and report, in order.
    Run,

    /// Show the last message id recorded for each channel.
    Checkpoints,

    /// Show warehouse statistics.
    Stats,

    /// Run an analytical query.
    Query {
        #[command(subcommand)]
        query: QueryKind,
    },

    /// Start the read-only HTTP query API.
    Serve,
}

#[derive(Subcommand)]
enum QueryKind {
    /// Most frequent terms in message text.
    TopTerms {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Daily message count and views for a channel.
    Activity { channel: String },
    /// Messages containing a keyword, newest first.
    Search {
        keyword: String,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Image category histogram.
    Categories,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tg_warehouse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Warehouse initialized successfully.");
        }
        Commands::Scrape { channels, limit } => {
            let channels = if channels.is_empty() {
                None
            } else {
                Some(channels)
            };
            let summary = fetch::run_scrape(&cfg, channels, limit).await?;
            if summary.landed() == 0 && summary.failed() > 0 {
                anyhow::bail!("every channel failed");
            }
        }
        Commands::Load => {
            load::run_load(&cfg).await?;
        }
        Commands::Enrich => {
            enrich::run_enrich(&cfg).await?;
        }
        Commands::LoadDetections => {
            load_detections::run_load_detections(&cfg).await?;
        }
        Commands::Report => {
            report::run_report(&cfg).await?;
        }
        Commands::Run => {
            pipeline::run_all(&cfg).await?;
        }
        Commands::Checkpoints => {
            stats::run_checkpoints(&cfg)?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Query { query: kind } => {
            let command = match kind {
                QueryKind::TopTerms { limit } => QueryCommand::TopTerms { limit },
                QueryKind::Activity { channel } => QueryCommand::Activity { channel },
                QueryKind::Search { keyword, limit } => QueryCommand::Search { keyword, limit },
                QueryKind::Categories => QueryCommand::Categories,
            };
            query::run_query(&cfg, command).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
