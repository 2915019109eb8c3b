//! `rate_limit_windows` queries.

use super::{db_error, from_millis, to_millis, Store};
use crate::KeywardenError;
use chrono::{DateTime, Duration, Utc};

/// One key's current fixed window, as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Window opening time.
    pub window_start: DateTime<Utc>,
    /// Window closing time (exclusive).
    pub window_end: DateTime<Utc>,
    /// Requests counted in the window.
    pub request_count: i64,
}

#[derive(sqlx::FromRow)]
struct WindowRow {
    window_start: i64,
    window_end: i64,
    request_count: i64,
}

impl From<WindowRow> for WindowState {
    fn from(row: WindowRow) -> Self {
        Self {
            window_start: from_millis(row.window_start),
            window_end: from_millis(row.window_end),
            request_count: row.request_count,
        }
    }
}

impl Store {
    /// Count one request against the key's window in a single statement.
    ///
    /// Opens a window if none exists, rolls it over when `now` has reached
    /// its end, and otherwise increments it. Returns the post-update window.
    pub async fn hit_window(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
        window_seconds: i64,
    ) -> Result<WindowState, KeywardenError> {
        let start = to_millis(now);
        let end = to_millis(now + Duration::seconds(window_seconds));

        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            INSERT INTO rate_limit_windows (key_hash, window_start, window_end, request_count)
            VALUES (?1, ?2, ?3, 1)
            ON CONFLICT (key_hash) DO UPDATE SET
                window_start = CASE WHEN ?2 >= rate_limit_windows.window_end
                    THEN ?2 ELSE rate_limit_windows.window_start END,
                window_end = CASE WHEN ?2 >= rate_limit_windows.window_end
                    THEN ?3 ELSE rate_limit_windows.window_end END,
                request_count = CASE WHEN ?2 >= rate_limit_windows.window_end
                    THEN 1 ELSE rate_limit_windows.request_count + 1 END
            RETURNING window_start, window_end, request_count
            "#,
        )
        .bind(key_hash)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to increment rate limit window"))?;

        Ok(row.into())
    }

    /// Read a key's window without counting.
    pub async fn find_window(&self, key_hash: &str) -> Result<Option<WindowState>, KeywardenError> {
        let row = sqlx::query_as::<_, WindowRow>(
            "SELECT window_start, window_end, request_count FROM rate_limit_windows WHERE key_hash = ?1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to read rate limit window"))?;

        Ok(row.map(Into::into))
    }

    /// Delete windows that closed at or before `now`.
    pub async fn purge_expired_windows(&self, now: DateTime<Utc>) -> Result<u64, KeywardenError> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_end <= ?1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to purge rate limit windows"))?;
        Ok(result.rows_affected())
    }
}
