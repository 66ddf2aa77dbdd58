//! Logging system configuration and initialization
//!
//! This module provides the logging setup for rarity runs:
//! - Daily rolling log file (`rarity-sync.log`)
//! - Configuration based log level control with `RUST_LOG` override
//! - Structured JSON file logging (optional)
//! - Console and file output support
//! - Old log cleanup on startup

#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow};
use chrono::Utc;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Subscriber, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "rarity-sync.log";

// Keeps the non-blocking writers alive for the life of the process
static LOG_GUARDS: Lazy<Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// UTC timestamps with millisecond precision
struct UtcTimeFormatter;

impl FormatTime for UtcTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// Get the log directory relative to the executable location
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Build the filter: `RUST_LOG` wins, otherwise the configured level with
/// noisy dependency targets held back unless `trace` was asked for.
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;

    if !config.level.to_lowercase().contains("trace") {
        for directive in [
            "sqlx::query=warn",
            "sqlx::migrate=info",
            "sqlx::postgres=warn",
            "sqlx::sqlite=warn",
            "tokio=info",
            "runtime=warn",
        ] {
            filter = filter.add_directive(directive.parse()?);
        }
    }

    for (module, level) in &config.module_filters {
        match format!("{}={}", module, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => warn!("Ignoring log filter {}={}: {}", module, level, e),
        }
    }

    Ok(filter)
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Log directory from the config, or `logs/` next to the executable
fn resolve_log_dir(config: &LoggingConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(get_log_directory)
}

/// Output layers over the filtered registry. Each branch builds its own
/// `fmt::Layer` and boxes it, so file and console layers compose in any
/// combination.
fn build_output_layers(config: &LoggingConfig, log_dir: &Path) -> Result<Vec<BoxedLayer>> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

        if config.auto_cleanup_logs {
            cleanup_old_logs(log_dir, config.max_files)?;
        }

        let file_appender = rolling::daily(log_dir, LOG_FILE_NAME);
        let (file_writer, file_guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        let file_layer: BoxedLayer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(UtcTimeFormatter)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(UtcTimeFormatter)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_timer(UtcTimeFormatter)
                .with_target(false)
                .boxed(),
        );
    }

    Ok(layers)
}

/// Assemble the subscriber without installing it
pub fn build_subscriber(config: &LoggingConfig) -> Result<impl Subscriber + Send + Sync + 'static> {
    let env_filter = build_env_filter(config)?;
    let layers = build_output_layers(config, &resolve_log_dir(config))?;
    Ok(Registry::default().with(env_filter).with(layers))
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// ```bash
/// # Show all SQL statements issued by the batch writers
/// RUST_LOG="debug,sqlx::query=debug" rarity-sync rank
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    build_subscriber(config)?.try_init()?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log directory: {:?}", resolve_log_dir(config));
        info!("JSON format: {}", config.json_format);
    }

    Ok(())
}

/// Remove the oldest `rarity-sync.log*` files beyond `max_files`.
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_NAME));
        if path.is_file() && is_log {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let keep = max_files as usize;
    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!("Removed old log file: {:?}", path);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== rarity-sync {} ===", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
}
