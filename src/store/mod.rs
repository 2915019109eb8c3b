//! SQLite persistence for keys, windows, usage, add-ons, and reset audits.
//!
//! Counters are only ever changed by a single SQL statement
//! (`count = count + 1`, conditional decrement, guarded reset), never by
//! load-then-save. Timestamps are stored as Unix milliseconds, calendar
//! dates as `YYYY-MM-DD`, and lists as comma-joined text.

mod addons;
mod audit;
mod keys;
mod schema;
mod usage;
mod windows;

pub use usage::ResetApplied;
pub(crate) use usage::CallRecord;
#[cfg(test)]
pub(crate) use usage::fixtures as usage_fixtures;
pub use windows::WindowState;

use crate::config::KeywardenConfig;
use crate::KeywardenError;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How long a writer waits for a competing writer before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool size for file-backed databases.
const MAX_CONNECTIONS: u32 = 8;

/// Handle to the gatekeeping database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) a file-backed database in WAL mode.
    pub async fn open(path: &Path) -> Result<Self, KeywardenError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                KeywardenError::Storage(format!("Failed to create database dir: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(db_error("Failed to open database"))?;

        Self::initialize(pool).await
    }

    /// Open the database under `dirs::data_dir()/<namespace>/`.
    pub async fn with_namespace(namespace: &str) -> Result<Self, KeywardenError> {
        let base_dir = dirs::data_dir()
            .ok_or_else(|| KeywardenError::Storage("Could not find data directory".to_string()))?;
        Self::open(&base_dir.join(namespace).join("keywarden.db")).await
    }

    /// Open the database the configuration points at.
    pub async fn from_config(config: &KeywardenConfig) -> Result<Self, KeywardenError> {
        Self::open(&config.resolve_database_path()?).await
    }

    /// Private in-memory database on a single never-recycled connection.
    pub async fn in_memory() -> Result<Self, KeywardenError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_error("Invalid in-memory database URL"))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_error("Failed to open in-memory database"))?;

        Self::initialize(pool).await
    }

    async fn initialize(pool: SqlitePool) -> Result<Self, KeywardenError> {
        schema::apply(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying connection pool, for read-only projections.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> KeywardenError {
    move |e| KeywardenError::Storage(format!("{}: {}", context, e))
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, KeywardenError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| KeywardenError::Storage(format!("Invalid stored date {:?}: {}", raw, e)))
}

pub(crate) fn join_list<T: AsRef<str>>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.as_ref().trim())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_list_encoding() {
        assert_eq!(join_list(&["10.0.0.1", " 192.168.1.0/24 "]), "10.0.0.1,192.168.1.0/24");
        assert_eq!(split_list("10.0.0.1, 192.168.1.0/24,,"), vec!["10.0.0.1", "192.168.1.0/24"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_time_encoding() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(from_millis(to_millis(dt)), dt);

        let date = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        assert_eq!(format_date(date), "2025-02-01");
        assert_eq!(parse_date("2025-02-01").unwrap(), date);
        assert!(parse_date("02/01/2025").is_err());
    }

    #[tokio::test]
    async fn test_open_creates_file_and_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("keywarden.db");

        let store = Store::open(&path).await.unwrap();
        assert!(path.exists());

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('api_keys', 'rate_limit_windows', 'monthly_usage', 'add_on_grants', 'quota_reset_audit')",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(tables, 5);
        store.close().await;

        // Reopening applies the schema idempotently
        let reopened = Store::open(&path).await.unwrap();
        reopened.close().await;
    }
}
