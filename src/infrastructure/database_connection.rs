// Database connection and pool management
// SQLite pools for local runs and tests, PostgreSQL pools for the production store

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use tracing::info;

use crate::domain::errors::{RarityError, RarityResult, StoreError};
use crate::domain::repositories::RarityStore;
use crate::infrastructure::config::{DatabaseBackend, RaritySyncConfig};
use crate::infrastructure::postgres_rarity_store::PostgresRarityStore;
use crate::infrastructure::sqlite_rarity_store::SqliteRarityStore;

/// Pool sizing shared by both backends.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::with_settings(database_url, PoolSettings::default()).await
    }

    /// Open (creating the file if needed) a SQLite database.
    pub async fn with_settings(database_url: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the rarity schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let create_collections_sql = r"
            CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                is_rarity BOOLEAN DEFAULT 0
            )
        ";

        let create_asset_sql = r"
            CREATE TABLE IF NOT EXISTS asset (
                id TEXT PRIMARY KEY,
                token_id TEXT,
                traits TEXT
            )
        ";

        let create_asset_extra_sql = r"
            CREATE TABLE IF NOT EXISTS asset_extra (
                asset_id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                rarity_ranking INTEGER,
                FOREIGN KEY (asset_id) REFERENCES asset (id) ON DELETE CASCADE,
                FOREIGN KEY (collection_id) REFERENCES collections (id) ON DELETE CASCADE
            )
        ";

        let create_asset_traits_sql = r"
            CREATE TABLE IF NOT EXISTS asset_traits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id TEXT NOT NULL,
                asset_id TEXT,
                trait_type TEXT NOT NULL,
                value TEXT NOT NULL,
                rarity_percent REAL,
                total_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (collection_id) REFERENCES collections (id) ON DELETE CASCADE
            )
        ";

        let create_indexes_sql = [
            "CREATE INDEX IF NOT EXISTS idx_asset_extra_collection ON asset_extra (collection_id)",
            "CREATE INDEX IF NOT EXISTS idx_asset_traits_key ON asset_traits (collection_id, trait_type, value)",
        ];

        sqlx::query(create_collections_sql).execute(&self.pool).await?;
        sqlx::query(create_asset_sql).execute(&self.pool).await?;
        sqlx::query(create_asset_extra_sql).execute(&self.pool).await?;
        sqlx::query(create_asset_traits_sql).execute(&self.pool).await?;
        for sql in create_indexes_sql {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        Ok(())
    }
}

pub async fn connect_postgres(database_url: &str, settings: PoolSettings) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Open the store selected by the configured database URL.
///
/// A connection failure is reported as `SourceUnavailable`: nothing has
/// been read or written yet.
pub async fn connect_store(config: &RaritySyncConfig) -> RarityResult<Arc<dyn RarityStore>> {
    let url = config.database_url()?;
    let settings = PoolSettings {
        max_connections: config.database.max_connections,
        acquire_timeout: Duration::from_secs(config.database.acquire_timeout_secs),
    };
    let unavailable = |e: StoreError| RarityError::SourceUnavailable {
        collection: config.collection.slug.clone(),
        reason: e.to_string(),
    };

    match DatabaseBackend::from_url(&url)? {
        DatabaseBackend::Sqlite => {
            let db = DatabaseConnection::with_settings(&url, settings)
                .await
                .map_err(unavailable)?;
            db.migrate().await.map_err(unavailable)?;
            info!("Connected to SQLite rarity store");
            Ok(Arc::new(SqliteRarityStore::new(db.pool().clone())))
        }
        DatabaseBackend::Postgres => {
            let pool = connect_postgres(&url, settings).await.map_err(unavailable)?;
            info!("Connected to PostgreSQL rarity store");
            Ok(Arc::new(PostgresRarityStore::new(pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_connection_creates_file() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url).await.unwrap();
        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_database_migration_is_repeatable() {
        let temp_dir = tempdir().unwrap();
        let database_url = format!("sqlite:{}", temp_dir.path().join("rarity.db").display());

        let db = DatabaseConnection::new(&database_url).await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN \
             ('collections', 'asset', 'asset_extra', 'asset_traits') ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["asset", "asset_extra", "asset_traits", "collections"]);
    }
}
