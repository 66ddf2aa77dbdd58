//! Replication source and sink adapters
//!
//! `SqliteRowSource` extracts a table's window into JSON rows; the
//! `NdjsonFileSink` lands them as newline-delimited JSON, one file per
//! table and window start date.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::application::replication::{
    ReplicationError, Row, RowSource, TableSpec, TimeWindow, WarehouseSink,
};
use crate::domain::errors::StoreError;

pub struct SqliteRowSource {
    pool: SqlitePool,
}

impl SqliteRowSource {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// `SELECT <columns> FROM <from> WHERE <time> BETWEEN ? AND ?`
pub(crate) fn extraction_query(spec: &TableSpec) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} BETWEEN ? AND ?",
        spec.query_columns.join(", "),
        spec.from_clause,
        spec.time_column
    )
}

/// Decode a row by the storage class of each cell.
fn decode_row(row: &SqliteRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Number::from_f64(row.try_get::<f64, _>(index)?).map_or(Value::Null, Value::Number),
                "BLOB" => Value::String(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index)?).into_owned()),
                _ => Value::String(row.try_get::<String, _>(index)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl RowSource for SqliteRowSource {
    async fn fetch_rows(&self, spec: &TableSpec, window: &TimeWindow) -> Result<Vec<Row>, StoreError> {
        let sql = extraction_query(spec);
        debug!(table = %spec.table, %sql, "Extracting window");

        let rows = sqlx::query(&sql)
            .bind(window.start_text())
            .bind(window.end_text())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_row).collect()
    }
}

/// Writes `<table>_<YYYYMMDD>.ndjson` under `dir`, replacing any earlier
/// load of the same window.
pub struct NdjsonFileSink {
    dir: PathBuf,
}

impl NdjsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn target_path(&self, table: &str, window: &TimeWindow) -> PathBuf {
        self.dir
            .join(format!("{}_{}.ndjson", table, window.start.format("%Y%m%d")))
    }
}

#[async_trait]
impl WarehouseSink for NdjsonFileSink {
    async fn load(&self, table: &str, window: &TimeWindow, rows: &[Row]) -> Result<u64, ReplicationError> {
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.target_path(table, window);
        tokio::fs::write(&path, body).await?;

        info!(table, path = %path.display(), rows = rows.len(), "Warehouse load written");
        Ok(rows.len() as u64)
    }
}
