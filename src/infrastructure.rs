//! Infrastructure layer for configuration, logging and storage
//!
//! This module provides database connections, the SQLite and PostgreSQL
//! rarity stores, CSV report export and the warehouse replication adapters.

pub mod config;
pub mod database_connection;
pub mod logging;
pub mod postgres_rarity_store;
pub mod replication_adapters;
pub mod report_export;
pub mod sqlite_rarity_store;

// Re-export commonly used items
pub use config::{DatabaseBackend, LoggingConfig, RaritySyncConfig};
pub use database_connection::{DatabaseConnection, PoolSettings, connect_postgres, connect_store};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use postgres_rarity_store::PostgresRarityStore;
pub use replication_adapters::{NdjsonFileSink, SqliteRowSource};
pub use report_export::CsvReportExporter;
pub use sqlite_rarity_store::SqliteRarityStore;
