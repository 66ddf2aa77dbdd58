//! rarity-sync command line
//!
//! `rank` runs the rarity pipeline for one collection and prints the run
//! summary as JSON; `replicate` copies one table window into the warehouse.
//! Exit codes: 0 success, 2 partial success, 1 failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rarity_sync::application::replication::{ReplicationJob, TableSpec, TimeWindow};
use rarity_sync::application::sync_orchestrator::SyncOrchestrator;
use rarity_sync::infrastructure::config::{DatabaseBackend, RaritySyncConfig};
use rarity_sync::infrastructure::database_connection::{
    DatabaseConnection, PoolSettings, connect_store,
};
use rarity_sync::infrastructure::logging::{init_logging_with_config, log_system_info};
use rarity_sync::infrastructure::replication_adapters::{NdjsonFileSink, SqliteRowSource};
use rarity_sync::infrastructure::report_export::CsvReportExporter;

/// Attribute rarity ranking and store synchronization for NFT collections
#[derive(Parser, Debug)]
#[command(name = "rarity-sync", version)]
#[command(about = "Rank NFT collections by attribute rarity", long_about = None)]
struct Cli {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score and rank a collection, then write the results back
    Rank {
        /// Collection slug, overrides `COLLECTION_SLUG`
        #[arg(long)]
        collection: Option<String>,

        /// Skip the CSV reports
        #[arg(long)]
        no_export: bool,
    },
    /// Replicate one table window into the warehouse directory
    Replicate {
        /// `user_accounts` or `wallet_history`
        #[arg(long)]
        table: String,

        /// Window start (`YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`), defaults to yesterday
        #[arg(long, requires = "end")]
        start: Option<String>,

        /// Window end, inclusive
        #[arg(long, requires = "start")]
        end: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RaritySyncConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rarity-sync: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging_with_config(&config.logging) {
        eprintln!("rarity-sync: logging disabled: {e:#}");
    }
    log_system_info();

    let outcome = match cli.command {
        Command::Rank {
            collection,
            no_export,
        } => run_rank(config, collection, no_export).await,
        Command::Replicate { table, start, end } => {
            run_replicate(&config, &table, start.as_deref(), end.as_deref()).await
        }
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("rarity-sync: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_rank(
    mut config: RaritySyncConfig,
    collection: Option<String>,
    no_export: bool,
) -> Result<u8> {
    if let Some(slug) = collection {
        config.collection.slug = slug;
    }
    config.validate()?;

    let slug = config.collection.slug.clone();
    if let Some(address) = config.contract_address() {
        info!(collection = %slug, contract_address = address, "Collection contract");
    }

    let store = connect_store(&config).await?;
    let mut orchestrator = SyncOrchestrator::new(store, config.pipeline_settings());
    if config.export.enabled && !no_export {
        orchestrator = orchestrator.with_exporter(CsvReportExporter::new(&config.export.output_dir));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let summary = orchestrator.run(&slug, &cancel).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serializing run summary")?
    );

    Ok(summary.status.exit_code())
}

async fn run_replicate(
    config: &RaritySyncConfig,
    table: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<u8> {
    config.validate_connection()?;
    let spec = TableSpec::builtin(table)?;
    let window = match (start, end) {
        (Some(start), Some(end)) => TimeWindow::parse(start, end)?,
        _ => TimeWindow::previous_day(Local::now().naive_local()),
    };

    let url = config.database_url()?;
    if config.backend()? != DatabaseBackend::Sqlite {
        bail!("replication source must be a sqlite: database");
    }

    let settings = PoolSettings {
        max_connections: config.database.max_connections,
        acquire_timeout: Duration::from_secs(config.database.acquire_timeout_secs),
    };
    let db = DatabaseConnection::with_settings(&url, settings)
        .await
        .context("opening replication source")?;

    let source = SqliteRowSource::new(db.pool().clone());
    let sink = NdjsonFileSink::new(&config.replication.output_dir);
    let outcome = ReplicationJob::new(spec, window).run(&source, &sink).await?;

    println!(
        "{}",
        serde_json::json!({
            "table": outcome.table,
            "window": outcome.window,
            "rows_loaded": outcome.rows_loaded,
        })
    );
    Ok(0)
}
