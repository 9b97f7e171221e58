//! # HVDC Log Store CLI (`hvdc`)
//!
//! The `hvdc` binary is the primary interface for the log store. It provides
//! commands for database initialization, the HTTP ingest server, the
//! bronze → silver rollup pipeline, KPI queries, and store statistics.
//!
//! ## Usage
//!
//! ```bash
//! hvdc --config ./config/hvdc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hvdc init` | Create the SQLite database and run schema migrations |
//! | `hvdc serve` | Start the HTTP ingest + KPI server |
//! | `hvdc pipeline run` | Roll bronze JSONL up into the DuckDB warehouse |
//! | `hvdc kpi` | Print daily KPI rows as JSON |
//! | `hvdc stats` | Print a store overview |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! hvdc init --config ./config/hvdc.toml
//!
//! # Start the HTTP server
//! hvdc serve --config ./config/hvdc.toml
//!
//! # Rebuild the warehouse from bronze files
//! hvdc pipeline run --config ./config/hvdc.toml
//!
//! # Daily KPIs for one group since a date
//! hvdc kpi --since 2024-01-01 --group-name "HVDC Ops" --config ./config/hvdc.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use hvdc_log_store::config;
use hvdc_log_store::db;
use hvdc_log_store::kpi::{self, KpiFilter};
use hvdc_log_store::migrate;
use hvdc_log_store::pipeline::{DuckDbPipeline, PipelineRunner};
use hvdc_log_store::server;
use hvdc_log_store::stats;
use hvdc_log_store::store::LogStore;

/// HVDC Log Store CLI — a local-first ingestion and KPI reporting service
/// for logistics WhatsApp summary logs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hvdc.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hvdc",
    about = "HVDC Log Store — local-first log ingestion and KPI reporting",
    version,
    long_about = "HVDC Log Store accepts authenticated WhatsApp summary logs over HTTP, \
    fans each record out to CSV, SQLite and bronze JSONL sinks, and rolls the bronze layer \
    up into a DuckDB warehouse backing daily KPI queries and CSV exports."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/hvdc.toml`. All storage, auth, and server
    /// settings are read from this file.
    #[arg(long, global = true, default_value = "./config/hvdc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (logs, idempotency, jobs). This command is idempotent — running it
    /// multiple times is safe.
    Init,

    /// Start the HTTP ingest + KPI server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// ingest, KPI, and pipeline endpoints.
    Serve,

    /// Rollup pipeline commands.
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Print daily KPI rows as JSON.
    ///
    /// Reads from the DuckDB warehouse when available, falling back to a
    /// direct SQLite aggregation otherwise.
    Kpi {
        /// Only include days on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only include days on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Filter to a single group name (exact match).
        #[arg(long)]
        group_name: Option<String>,
    },

    /// Print a store overview.
    ///
    /// Shows record counts, per-group breakdowns, and sink sizes.
    Stats,
}

/// Rollup pipeline subcommands.
#[derive(Subcommand)]
enum PipelineAction {
    /// Rebuild the DuckDB warehouse from bronze JSONL files.
    ///
    /// Re-reads every bronze file, recreates the raw and silver tables,
    /// and refreshes the daily KPI view. Safe to run repeatedly.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            migrate::run_migrations(&cfg).await?;
            let pool = db::connect(&cfg).await?;
            let store = Arc::new(LogStore::new(cfg.storage.clone(), pool));
            let runner: Arc<dyn PipelineRunner> = Arc::new(DuckDbPipeline::new(
                cfg.storage.bronze_root(),
                cfg.storage.duckdb_file(),
            ));
            server::run_server(Arc::new(cfg), store, runner).await?;
        }
        Commands::Pipeline { action } => match action {
            PipelineAction::Run => {
                let pipeline =
                    DuckDbPipeline::new(cfg.storage.bronze_root(), cfg.storage.duckdb_file());
                let report = tokio::task::spawn_blocking(move || pipeline.run()).await??;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
        Commands::Kpi {
            since,
            until,
            group_name,
        } => {
            let pool = db::connect(&cfg).await?;
            let filter = KpiFilter {
                since,
                until,
                group_name,
            };
            let rows = kpi::query_kpi(&cfg.storage, &pool, &filter).await?;
            println!("{}", serde_json::to_string_pretty(&kpi::rows_to_json(&rows, &filter))?);
            pool.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
