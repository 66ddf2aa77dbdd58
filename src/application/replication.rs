//! Warehouse replication
//!
//! Copies rows changed inside a time window from an operational table into
//! an analytical sink, coercing every configured column to its warehouse
//! type first. No ranking, no batching: extract, coerce, load.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::errors::StoreError;

/// One extracted row, column name -> value.
pub type Row = Map<String, Value>;

const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Unknown replication table: {0}")]
    UnknownTable(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Source read failed: {0}")]
    Source(#[from] StoreError),

    #[error("Sink write failed: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Warehouse column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Timestamp,
    Boolean,
}

/// Which rows to extract and how to type them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Destination table name
    pub table: String,
    /// Select-list expressions
    pub query_columns: Vec<String>,
    /// `FROM` clause including joins
    pub from_clause: String,
    /// Column compared against the window bounds
    pub time_column: String,
    pub column_types: Vec<(String, ColumnType)>,
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| (*c).to_string()).collect()
}

fn typed(pairs: &[(&str, ColumnType)]) -> Vec<(String, ColumnType)> {
    pairs.iter().map(|(c, t)| ((*c).to_string(), *t)).collect()
}

impl TableSpec {
    pub fn user_accounts() -> Self {
        use ColumnType::{String, Timestamp};
        Self {
            table: "user_accounts".to_string(),
            query_columns: columns(&[
                "user_accounts.id",
                "username",
                "user_accounts.created_at",
                "roles",
                "last_login_at",
            ]),
            from_clause: "user_accounts".to_string(),
            time_column: "user_accounts.updated_at".to_string(),
            column_types: typed(&[
                ("id", String),
                ("username", String),
                ("created_at", Timestamp),
                ("roles", String),
                ("last_login_at", Timestamp),
            ]),
        }
    }

    pub fn wallet_history() -> Self {
        use ColumnType::{Boolean, Int64, String, Timestamp};
        Self {
            table: "wallet_history".to_string(),
            query_columns: columns(&[
                "wallet_history.id",
                "wallet_address",
                "chain_id",
                "contract_address",
                "event",
                "tag",
                "is_main_event",
                "symbol",
                "out_amount",
                "in_amount",
                "out_amount_usd",
                "in_amount_usd",
                "to_address",
                "nft_address",
                "currency_address",
                "token_id",
                "bool",
                "block_time",
                "wallet_history.block",
                "tx_hash",
                "log_index",
                "fee",
                "native_usd_price",
                "ip",
                "area",
                "wallet_history.created_at",
                "wallet_history.updated_at",
                "wallet_history.deleted_at",
                "is_sa",
                "is_paymaster",
                "order_hash",
                "username",
            ]),
            from_clause: "wallet_history \
                LEFT JOIN user_wallets ON wallet_history.wallet_address = user_wallets.address \
                LEFT JOIN user_accounts ON user_wallets.account_id = user_accounts.id"
                .to_string(),
            time_column: "wallet_history.created_at".to_string(),
            column_types: typed(&[
                ("id", String),
                ("wallet_address", String),
                ("chain_id", Int64),
                ("contract_address", String),
                ("event", String),
                ("tag", String),
                ("is_main_event", Boolean),
                ("symbol", String),
                ("out_amount", String),
                ("in_amount", String),
                ("out_amount_usd", String),
                ("in_amount_usd", String),
                ("to_address", String),
                ("nft_address", String),
                ("currency_address", String),
                ("token_id", String),
                ("bool", Boolean),
                ("block_time", Timestamp),
                ("block", Int64),
                ("tx_hash", String),
                ("log_index", Int64),
                ("fee", String),
                ("native_usd_price", String),
                ("ip", String),
                ("area", String),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
                ("deleted_at", Timestamp),
                ("is_sa", Boolean),
                ("is_paymaster", Boolean),
                ("order_hash", String),
            ]),
        }
    }

    /// Look up one of the built-in specs by table name.
    pub fn builtin(table: &str) -> Result<Self, ReplicationError> {
        match table {
            "user_accounts" => Ok(Self::user_accounts()),
            "wallet_history" => Ok(Self::wallet_history()),
            other => Err(ReplicationError::UnknownTable(other.to_string())),
        }
    }

    /// Coerce the typed columns of `row`; other columns pass through.
    pub fn coerce_row(&self, mut row: Row) -> Row {
        for (column, column_type) in &self.column_types {
            if let Some(value) = row.get_mut(column) {
                *value = coerce(value, *column_type);
            }
        }
        row
    }
}

/// Inclusive extraction window, in store-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, ReplicationError> {
        if start > end {
            return Err(ReplicationError::InvalidWindow(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// 00:00:00 through 23:59:59 of the day before `now`.
    pub fn previous_day(now: NaiveDateTime) -> Self {
        let day = now.date() - ChronoDuration::days(1);
        Self {
            start: day.and_time(NaiveTime::default()),
            end: day.and_hms_opt(23, 59, 59).unwrap_or(day.and_time(NaiveTime::default())),
        }
    }

    /// Parse `YYYY-MM-DD HH:MM:SS` or plain `YYYY-MM-DD` bounds. A plain date
    /// end bound covers the whole day.
    pub fn parse(start: &str, end: &str) -> Result<Self, ReplicationError> {
        let start = parse_bound(start, NaiveTime::default())?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::default());
        let end = parse_bound(end, end_of_day)?;
        Self::new(start, end)
    }

    pub fn start_text(&self) -> String {
        self.start.format(WINDOW_FORMAT).to_string()
    }

    pub fn end_text(&self) -> String {
        self.end.format(WINDOW_FORMAT).to_string()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start_text(), self.end_text())
    }
}

fn parse_bound(raw: &str, default_time: NaiveTime) -> Result<NaiveDateTime, ReplicationError> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, WINDOW_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(default_time)))
        .map_err(|_| ReplicationError::InvalidWindow(format!("cannot parse '{raw}'")))
}

/// Coerce one value to a warehouse type.
///
/// Unparsable or null numbers become zero, unparsable timestamps become
/// null, booleans follow truthiness, a null string stays null.
pub fn coerce(value: &Value, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::Int64 => Value::from(to_f64(value).map_or(0, |n| n.trunc() as i64)),
        ColumnType::Float64 => Value::from(to_f64(value).unwrap_or(0.0)),
        ColumnType::Timestamp => to_timestamp(value).map_or(Value::Null, Value::String),
        ColumnType::Boolean => Value::Bool(truthy(value)),
        ColumnType::String => match value {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    };
    number.filter(|n| n.is_finite())
}

fn to_timestamp(value: &Value) -> Option<String> {
    let parsed = match value {
        Value::String(s) => parse_timestamp(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc()),
        _ => None,
    }?;
    Some(parsed.and_utc().to_rfc3339())
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::default()))
        })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Operational store rows can be read from.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_rows(&self, spec: &TableSpec, window: &TimeWindow) -> Result<Vec<Row>, StoreError>;
}

/// Analytical destination rows are loaded into.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Load `rows` into `table`, returning how many were written.
    async fn load(&self, table: &str, window: &TimeWindow, rows: &[Row]) -> Result<u64, ReplicationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationOutcome {
    pub table: String,
    pub window: String,
    pub rows_loaded: u64,
}

pub struct ReplicationJob {
    spec: TableSpec,
    window: TimeWindow,
}

impl ReplicationJob {
    pub const fn new(spec: TableSpec, window: TimeWindow) -> Self {
        Self { spec, window }
    }

    pub async fn run(
        &self,
        source: &dyn RowSource,
        sink: &dyn WarehouseSink,
    ) -> Result<ReplicationOutcome, ReplicationError> {
        info!(table = %self.spec.table, window = %self.window, "Replication started");

        let rows = source.fetch_rows(&self.spec, &self.window).await?;
        if rows.is_empty() {
            warn!(table = %self.spec.table, window = %self.window, "No rows in window");
        }

        let rows: Vec<Row> = rows.into_iter().map(|row| self.spec.coerce_row(row)).collect();
        let rows_loaded = sink.load(&self.spec.table, &self.window, &rows).await?;

        info!(table = %self.spec.table, rows_loaded, "Replication finished");
        Ok(ReplicationOutcome {
            table: self.spec.table.clone(),
            window: self.window.to_string(),
            rows_loaded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Mutex;

    #[rstest]
    #[case(json!("42"), ColumnType::Int64, json!(42))]
    #[case(json!("4.9"), ColumnType::Int64, json!(4))]
    #[case(json!("abc"), ColumnType::Int64, json!(0))]
    #[case(json!(null), ColumnType::Int64, json!(0))]
    #[case(json!("1.5"), ColumnType::Float64, json!(1.5))]
    #[case(json!(null), ColumnType::Float64, json!(0.0))]
    #[case(json!("2024-09-12 08:30:00"), ColumnType::Timestamp, json!("2024-09-12T08:30:00+00:00"))]
    #[case(json!("not a date"), ColumnType::Timestamp, json!(null))]
    #[case(json!(0), ColumnType::Boolean, json!(false))]
    #[case(json!("yes"), ColumnType::Boolean, json!(true))]
    #[case(json!(null), ColumnType::Boolean, json!(false))]
    #[case(json!(7), ColumnType::String, json!("7"))]
    #[case(json!(null), ColumnType::String, json!(null))]
    fn coercion_rules(#[case] input: Value, #[case] column_type: ColumnType, #[case] expected: Value) {
        assert_eq!(coerce(&input, column_type), expected);
    }

    #[test]
    fn previous_day_covers_whole_day() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap();
        let window = TimeWindow::previous_day(now);
        assert_eq!(window.start_text(), "2024-02-29 00:00:00");
        assert_eq!(window.end_text(), "2024-02-29 23:59:59");
    }

    #[test]
    fn window_parsing_rejects_reversed_bounds() {
        let window = TimeWindow::parse("2023-06-10", "2024-09-12").unwrap();
        assert_eq!(window.end_text(), "2024-09-12 23:59:59");
        assert!(TimeWindow::parse("2024-09-12", "2023-06-10").is_err());
        assert!(TimeWindow::parse("yesterday", "2023-06-10").is_err());
    }

    #[test]
    fn unknown_table_is_rejected() {
        assert!(TableSpec::builtin("wallet_history").is_ok());
        assert!(matches!(
            TableSpec::builtin("orders"),
            Err(ReplicationError::UnknownTable(_))
        ));
    }

    struct FixedSource(Vec<Row>);

    #[async_trait]
    impl RowSource for FixedSource {
        async fn fetch_rows(&self, _spec: &TableSpec, _window: &TimeWindow) -> Result<Vec<Row>, StoreError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct CapturingSink(Mutex<Vec<Row>>);

    #[async_trait]
    impl WarehouseSink for CapturingSink {
        async fn load(&self, _table: &str, _window: &TimeWindow, rows: &[Row]) -> Result<u64, ReplicationError> {
            self.0.lock().unwrap().extend_from_slice(rows);
            Ok(rows.len() as u64)
        }
    }

    #[tokio::test]
    async fn job_coerces_before_loading() {
        let row = json!({
            "id": 5,
            "username": null,
            "created_at": "2024-01-02 03:04:05",
            "roles": "admin",
            "last_login_at": "",
            "extra": "kept"
        });
        let Value::Object(row) = row else { unreachable!() };

        let window = TimeWindow::parse("2024-01-01", "2024-01-31").unwrap();
        let job = ReplicationJob::new(TableSpec::user_accounts(), window);
        let sink = CapturingSink::default();
        let outcome = job.run(&FixedSource(vec![row]), &sink).await.unwrap();

        assert_eq!(outcome.rows_loaded, 1);
        let loaded = sink.0.lock().unwrap();
        assert_eq!(loaded[0]["id"], json!("5"));
        assert_eq!(loaded[0]["username"], Value::Null);
        assert_eq!(loaded[0]["created_at"], json!("2024-01-02T03:04:05+00:00"));
        assert_eq!(loaded[0]["last_login_at"], Value::Null);
        assert_eq!(loaded[0]["extra"], json!("kept"));
    }
}
