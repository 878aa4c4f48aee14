//! Append-only telemetry history in SQLite.
//!
//! Each device variant owns one fixed table (`climate_log`, `pump_log`, ...)
//! whose columns are declared at compile time by its [`Record`] type. The
//! device identifier is stored as a bound value in every row; it never
//! becomes part of the SQL text.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Schema description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
}

impl Column {
    pub const fn integer(name: &'static str) -> Self {
        Self { name, kind: ColumnType::Integer }
    }

    pub const fn real(name: &'static str) -> Self {
        Self { name, kind: ColumnType::Real }
    }

    pub const fn text(name: &'static str) -> Self {
        Self { name, kind: ColumnType::Text }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub table: &'static str,
    pub columns: &'static [Column],
}

impl Schema {
    fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.kind.sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
               id INTEGER PRIMARY KEY AUTOINCREMENT, \
               device_id TEXT NOT NULL, \
               ts DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP, \
               {})",
            self.table,
            columns.join(", ")
        )
    }

    fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {0}_device_idx ON {0} (device_id, id)",
            self.table
        )
    }

    fn insert_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        let placeholders = vec!["?"; self.columns.len() + 1].join(", ");
        format!(
            "INSERT INTO {} (device_id, {}) VALUES ({placeholders})",
            self.table,
            names.join(", ")
        )
    }

    fn select_recent_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        format!(
            "SELECT id, CAST(ts AS TEXT) AS ts, {} FROM {} \
             WHERE device_id = ? ORDER BY id DESC LIMIT ?",
            names.join(", "),
            self.table
        )
    }

    fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {} WHERE device_id = ?", self.table)
    }
}

/// One value in a telemetry row, in schema column order.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Integer(i64),
    Real(Option<f64>),
    Text(String),
}

/// A typed telemetry row for one device variant.
pub trait Record: Send + Sync + Sized {
    const SCHEMA: Schema;

    /// Values in the same order as `SCHEMA.columns`.
    fn fields(&self) -> Vec<Field>;

    fn from_row(row: &SqliteRow) -> Result<Self>;
}

/// A stored record together with its identity and insertion timestamp.
#[derive(Debug, Clone)]
pub struct Stamped<R> {
    pub id: i64,
    pub ts: String,
    pub record: R,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TelemetryLog {
    pool: Pool<Sqlite>,
    ready: Arc<Mutex<HashSet<(String, &'static str)>>>,
}

impl TelemetryLog {
    /// db_url examples:
    /// - "sqlite:/home/pi/envctl/telemetry.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to `:memory:` is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self {
            pool,
            ready: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Create the variant table for `device_id` if needed. Idempotent.
    pub async fn ensure_schema<R: Record>(&self, device_id: &str) -> Result<()> {
        let key = (device_id.to_string(), R::SCHEMA.table);
        if self.ready().contains(&key) {
            return Ok(());
        }

        sqlx::query(&R::SCHEMA.create_table_sql())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create table {}", R::SCHEMA.table))?;
        sqlx::query(&R::SCHEMA.create_index_sql())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to index table {}", R::SCHEMA.table))?;

        debug!(device = %device_id, table = R::SCHEMA.table, "telemetry schema ready");
        self.ready().insert(key);
        Ok(())
    }

    /// Append one row. Failures are logged and swallowed.
    pub async fn append<R: Record>(&self, device_id: &str, record: &R) {
        if let Err(e) = self.try_append(device_id, record).await {
            error!(
                device = %device_id,
                table = R::SCHEMA.table,
                "telemetry append failed: {e:#}"
            );
        }
    }

    async fn try_append<R: Record>(&self, device_id: &str, record: &R) -> Result<()> {
        self.ensure_schema::<R>(device_id).await?;

        let sql = R::SCHEMA.insert_sql();
        let mut query = sqlx::query(&sql).bind(device_id);
        for field in record.fields() {
            query = match field {
                Field::Integer(v) => query.bind(v),
                Field::Real(v) => query.bind(v),
                Field::Text(v) => query.bind(v),
            };
        }
        query
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert into {} failed", R::SCHEMA.table))?;
        Ok(())
    }

    /// Number of rows stored for `device_id`.
    pub async fn count<R: Record>(&self, device_id: &str) -> Result<i64> {
        self.ensure_schema::<R>(device_id).await?;
        let row = sqlx::query(&R::SCHEMA.count_sql())
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .context("telemetry count failed")?;
        Ok(row.try_get(0)?)
    }

    /// The newest `limit` rows for `device_id`, newest first.
    pub async fn recent<R: Record>(&self, device_id: &str, limit: i64) -> Result<Vec<Stamped<R>>> {
        self.ensure_schema::<R>(device_id).await?;
        let rows = sqlx::query(&R::SCHEMA.select_recent_sql())
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("telemetry query failed")?;

        rows.iter()
            .map(|row| -> Result<Stamped<R>> {
                Ok(Stamped {
                    id: row.try_get("id")?,
                    ts: row.try_get("ts")?,
                    record: R::from_row(row)?,
                })
            })
            .collect()
    }

    fn ready(&self) -> std::sync::MutexGuard<'_, HashSet<(String, &'static str)>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        level: i64,
        label: String,
        reading: Option<f64>,
    }

    impl Record for Sample {
        const SCHEMA: Schema = Schema {
            table: "sample_log",
            columns: &[
                Column::integer("level"),
                Column::text("label"),
                Column::real("reading"),
            ],
        };

        fn fields(&self) -> Vec<Field> {
            vec![
                Field::Integer(self.level),
                Field::Text(self.label.clone()),
                Field::Real(self.reading),
            ]
        }

        fn from_row(row: &SqliteRow) -> Result<Self> {
            Ok(Self {
                level: row.try_get("level")?,
                label: row.try_get("label")?,
                reading: row.try_get("reading")?,
            })
        }
    }

    /// Same table name, incompatible columns: simulates schema drift.
    #[derive(Debug)]
    struct Drifted;

    impl Record for Drifted {
        const SCHEMA: Schema = Schema {
            table: "sample_log",
            columns: &[Column::integer("missing_column")],
        };

        fn fields(&self) -> Vec<Field> {
            vec![Field::Integer(1)]
        }

        fn from_row(_row: &SqliteRow) -> Result<Self> {
            Ok(Self)
        }
    }

    fn sample(level: i64) -> Sample {
        Sample {
            level,
            label: format!("l{level}"),
            reading: Some(level as f64 / 2.0),
        }
    }

    async fn memory_log() -> TelemetryLog {
        TelemetryLog::connect("sqlite::memory:").await.unwrap()
    }

    async fn object_count(log: &TelemetryLog, kind: &str, name: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = ? AND name = ?")
            .bind(kind)
            .bind(name)
            .fetch_one(&log.pool)
            .await
            .unwrap()
            .get(0)
    }

    // -- ensure_schema --------------------------------------------------------

    #[tokio::test]
    async fn ensure_schema_twice_creates_one_table() {
        let log = memory_log().await;
        log.ensure_schema::<Sample>("dev-1").await.unwrap();
        log.ensure_schema::<Sample>("dev-1").await.unwrap();

        assert_eq!(object_count(&log, "table", "sample_log").await, 1);
        assert_eq!(object_count(&log, "index", "sample_log_device_idx").await, 1);
    }

    #[tokio::test]
    async fn ensure_schema_survives_fresh_handle_cache() {
        // A second handle has an empty readiness cache and re-runs the DDL.
        let log = memory_log().await;
        log.ensure_schema::<Sample>("dev-1").await.unwrap();
        let other = TelemetryLog {
            pool: log.pool.clone(),
            ready: Arc::new(Mutex::new(HashSet::new())),
        };
        other.ensure_schema::<Sample>("dev-1").await.unwrap();
        assert_eq!(object_count(&log, "table", "sample_log").await, 1);
    }

    #[test]
    fn generated_sql_uses_static_names_only() {
        let sql = Sample::SCHEMA.insert_sql();
        assert_eq!(
            sql,
            "INSERT INTO sample_log (device_id, level, label, reading) VALUES (?, ?, ?, ?)"
        );
    }

    // -- append / query -------------------------------------------------------

    #[tokio::test]
    async fn append_creates_schema_lazily() {
        let log = memory_log().await;
        log.append("dev-1", &sample(1)).await;
        assert_eq!(log.count::<Sample>("dev-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rows_are_scoped_by_device() {
        let log = memory_log().await;
        log.append("dev-1", &sample(1)).await;
        log.append("dev-1", &sample(2)).await;
        log.append("dev-2", &sample(3)).await;

        assert_eq!(log.count::<Sample>("dev-1").await.unwrap(), 2);
        assert_eq!(log.count::<Sample>("dev-2").await.unwrap(), 1);
        assert_eq!(log.count::<Sample>("dev-3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_returns_newest_first_with_identity() {
        let log = memory_log().await;
        for level in 1..=3 {
            log.append("dev-1", &sample(level)).await;
        }

        let rows = log.recent::<Sample>("dev-1", 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record, sample(3));
        assert_eq!(rows[1].record, sample(2));
        assert!(rows[0].id > rows[1].id);
        assert!(!rows[0].ts.is_empty());
    }

    #[tokio::test]
    async fn null_reals_round_trip() {
        let log = memory_log().await;
        let rec = Sample {
            level: 0,
            label: "unread".into(),
            reading: None,
        };
        log.append("dev-1", &rec).await;
        let rows = log.recent::<Sample>("dev-1", 1).await.unwrap();
        assert_eq!(rows[0].record.reading, None);
    }

    #[tokio::test]
    async fn append_failure_is_contained() {
        let log = memory_log().await;
        log.append("dev-1", &sample(1)).await;

        // Insert against a mismatched schema: logged, not propagated.
        log.append("dev-1", &Drifted).await;

        // Later appends of the correct shape still work.
        log.append("dev-1", &sample(2)).await;
        assert_eq!(log.count::<Sample>("dev-1").await.unwrap(), 2);
    }
}
