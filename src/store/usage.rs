//! `monthly_usage` queries.

use super::{db_error, format_date, from_millis, parse_date, to_millis, Store};
use crate::model::{CallOutcome, MonthlyUsage, UsageSnapshot};
use crate::KeywardenError;
use chrono::{DateTime, NaiveDate, Utc};

const USAGE_COLUMNS: &str = "id, api_key_id, account_id, month_year, total_calls, \
     successful_calls, failed_calls, quota_exceeded_calls, quota_limit, grace_limit, \
     last_reset_date, first_call_at, last_call_at, created_at, updated_at";

/// How a monthly reset landed on one usage row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetApplied {
    /// The row was moved into the new month with zeroed counters.
    Reset,
    /// A row for the new month already existed. It received the new limits
    /// and the stale row was stamped and kept as history.
    Merged,
    /// Another run reset the row first.
    AlreadyReset,
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    id: String,
    api_key_id: String,
    account_id: String,
    month_year: String,
    total_calls: i64,
    successful_calls: i64,
    failed_calls: i64,
    quota_exceeded_calls: i64,
    quota_limit: i64,
    grace_limit: i64,
    last_reset_date: String,
    first_call_at: Option<i64>,
    last_call_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl UsageRow {
    fn into_usage(self) -> Result<MonthlyUsage, KeywardenError> {
        Ok(MonthlyUsage {
            last_reset_date: parse_date(&self.last_reset_date)?,
            id: self.id,
            api_key_id: self.api_key_id,
            account_id: self.account_id,
            month_year: self.month_year,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            quota_exceeded_calls: self.quota_exceeded_calls,
            quota_limit: self.quota_limit,
            grace_limit: self.grace_limit,
            first_call_at: self.first_call_at.map(from_millis),
            last_call_at: self.last_call_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    total_calls: i64,
    successful_calls: i64,
    failed_calls: i64,
    quota_exceeded_calls: i64,
    quota_limit: i64,
    grace_limit: i64,
}

impl From<SnapshotRow> for UsageSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            total_calls: row.total_calls,
            successful_calls: row.successful_calls,
            failed_calls: row.failed_calls,
            quota_exceeded_calls: row.quota_exceeded_calls,
            quota_limit: row.quota_limit,
            grace_limit: row.grace_limit,
        }
    }
}

/// Parameters for one recorded call.
pub(crate) struct CallRecord<'a> {
    pub api_key_id: &'a str,
    pub account_id: &'a str,
    pub month_year: &'a str,
    pub month_start: NaiveDate,
    pub outcome: CallOutcome,
    pub now: DateTime<Utc>,
    pub default_quota: i64,
    pub default_grace: i64,
}

impl Store {
    /// Count one call in a single upsert and return the post-update counters.
    ///
    /// A row created by this call inherits its limits from the key's most
    /// recent earlier month, falling back to the supplied defaults.
    pub(crate) async fn record_call(
        &self,
        call: CallRecord<'_>,
    ) -> Result<UsageSnapshot, KeywardenError> {
        let (successful, failed, quota_exceeded) = call.outcome.increments();
        let now = to_millis(call.now);

        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            INSERT INTO monthly_usage (
                id, api_key_id, account_id, month_year,
                total_calls, successful_calls, failed_calls, quota_exceeded_calls,
                quota_limit, grace_limit, last_reset_date,
                first_call_at, last_call_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                1, ?5, ?6, ?7,
                COALESCE((SELECT quota_limit FROM monthly_usage
                          WHERE api_key_id = ?2 AND month_year < ?4
                          ORDER BY month_year DESC LIMIT 1), ?8),
                COALESCE((SELECT grace_limit FROM monthly_usage
                          WHERE api_key_id = ?2 AND month_year < ?4
                          ORDER BY month_year DESC LIMIT 1), ?9),
                ?10,
                ?11, ?11, ?11, ?11
            )
            ON CONFLICT (api_key_id, month_year) DO UPDATE SET
                total_calls = monthly_usage.total_calls + 1,
                successful_calls = monthly_usage.successful_calls + excluded.successful_calls,
                failed_calls = monthly_usage.failed_calls + excluded.failed_calls,
                quota_exceeded_calls = monthly_usage.quota_exceeded_calls + excluded.quota_exceeded_calls,
                first_call_at = COALESCE(monthly_usage.first_call_at, excluded.first_call_at),
                last_call_at = excluded.last_call_at,
                updated_at = excluded.updated_at
            RETURNING total_calls, successful_calls, failed_calls, quota_exceeded_calls,
                      quota_limit, grace_limit
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(call.api_key_id)
        .bind(call.account_id)
        .bind(call.month_year)
        .bind(successful)
        .bind(failed)
        .bind(quota_exceeded)
        .bind(call.default_quota)
        .bind(call.default_grace)
        .bind(format_date(call.month_start))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to record usage"))?;

        Ok(row.into())
    }

    /// The key's row for `month_year`, if any calls were made that month.
    pub async fn find_usage(
        &self,
        api_key_id: &str,
        month_year: &str,
    ) -> Result<Option<MonthlyUsage>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM monthly_usage WHERE api_key_id = ?1 AND month_year = ?2",
            USAGE_COLUMNS
        );
        sqlx::query_as::<_, UsageRow>(&sql)
            .bind(api_key_id)
            .bind(month_year)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load monthly usage"))?
            .map(UsageRow::into_usage)
            .transpose()
    }

    /// The key's most recent row of any month.
    pub async fn latest_usage(
        &self,
        api_key_id: &str,
    ) -> Result<Option<MonthlyUsage>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM monthly_usage WHERE api_key_id = ?1 \
             ORDER BY month_year DESC LIMIT 1",
            USAGE_COLUMNS
        );
        sqlx::query_as::<_, UsageRow>(&sql)
            .bind(api_key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load monthly usage"))?
            .map(UsageRow::into_usage)
            .transpose()
    }

    /// Every row of a key, newest month first.
    pub async fn usage_history(
        &self,
        api_key_id: &str,
    ) -> Result<Vec<MonthlyUsage>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM monthly_usage WHERE api_key_id = ?1 ORDER BY month_year DESC",
            USAGE_COLUMNS
        );
        sqlx::query_as::<_, UsageRow>(&sql)
            .bind(api_key_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to load usage history"))?
            .into_iter()
            .map(UsageRow::into_usage)
            .collect()
    }

    /// One page of rows due for the reset into `month_year`, ordered by id.
    ///
    /// Only each key's newest row from before `month_year` is a candidate;
    /// older history rows are left alone. Pass the last id of the previous
    /// page as `after_id` (empty for the first page).
    pub async fn reset_candidates(
        &self,
        reset_date: NaiveDate,
        month_year: &str,
        after_id: &str,
        limit: u32,
    ) -> Result<Vec<MonthlyUsage>, KeywardenError> {
        let sql = format!(
            r#"
            SELECT {} FROM monthly_usage AS m
            WHERE m.last_reset_date < ?1
              AND m.month_year < ?2
              AND m.id > ?3
              AND NOT EXISTS (
                  SELECT 1 FROM monthly_usage AS newer
                  WHERE newer.api_key_id = m.api_key_id
                    AND newer.month_year > m.month_year
                    AND newer.month_year < ?2
              )
            ORDER BY m.id ASC
            LIMIT ?4
            "#,
            USAGE_COLUMNS
        );
        sqlx::query_as::<_, UsageRow>(&sql)
            .bind(format_date(reset_date))
            .bind(month_year)
            .bind(after_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to select reset candidates"))?
            .into_iter()
            .map(UsageRow::into_usage)
            .collect()
    }

    /// Reset one usage row into a new month inside its own transaction.
    ///
    /// The first statement claims the row with the
    /// `last_reset_date < reset_date` guard, so overlapping runs reset each
    /// row at most once. The key's older history rows are stamped with the
    /// same `reset_date` and keep their counters.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_monthly_reset(
        &self,
        usage_id: &str,
        api_key_id: &str,
        reset_date: NaiveDate,
        month_year: &str,
        quota_limit: i64,
        grace_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<ResetApplied, KeywardenError> {
        let reset_date = format_date(reset_date);
        let now = to_millis(now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin reset transaction"))?;

        let claimed = sqlx::query(
            "UPDATE monthly_usage SET last_reset_date = ?1, updated_at = ?2 \
             WHERE id = ?3 AND last_reset_date < ?1",
        )
        .bind(&reset_date)
        .bind(now)
        .bind(usage_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to claim usage row"))?;

        if claimed.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(db_error("Failed to roll back reset transaction"))?;
            return Ok(ResetApplied::AlreadyReset);
        }

        // Older history rows of the key must not become candidates once this
        // row leaves the previous months.
        sqlx::query(
            "UPDATE monthly_usage SET last_reset_date = ?1, updated_at = ?2 \
             WHERE api_key_id = ?3 AND month_year < ?4 AND id <> ?5 AND last_reset_date < ?1",
        )
        .bind(&reset_date)
        .bind(now)
        .bind(api_key_id)
        .bind(month_year)
        .bind(usage_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to stamp usage history"))?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT id FROM monthly_usage WHERE api_key_id = ?1 AND month_year = ?2 AND id <> ?3",
        )
        .bind(api_key_id)
        .bind(month_year)
        .bind(usage_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to look up current month row"))?;

        let applied = match current {
            Some(current_id) => {
                sqlx::query(
                    "UPDATE monthly_usage SET quota_limit = ?1, grace_limit = ?2, \
                     last_reset_date = ?3, updated_at = ?4 WHERE id = ?5",
                )
                .bind(quota_limit)
                .bind(grace_limit)
                .bind(&reset_date)
                .bind(now)
                .bind(&current_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to apply limits to current month row"))?;
                ResetApplied::Merged
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE monthly_usage SET
                        month_year = ?1,
                        total_calls = 0,
                        successful_calls = 0,
                        failed_calls = 0,
                        quota_exceeded_calls = 0,
                        quota_limit = ?2,
                        grace_limit = ?3,
                        first_call_at = NULL,
                        last_call_at = NULL,
                        updated_at = ?4
                    WHERE id = ?5
                    "#,
                )
                .bind(month_year)
                .bind(quota_limit)
                .bind(grace_limit)
                .bind(now)
                .bind(usage_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to reset usage row"))?;
                ResetApplied::Reset
            }
        };

        tx.commit()
            .await
            .map_err(db_error("Failed to commit reset transaction"))?;

        Ok(applied)
    }

    /// Delete usage rows for months before `month_year`.
    pub async fn purge_usage_before(&self, month_year: &str) -> Result<u64, KeywardenError> {
        let result = sqlx::query("DELETE FROM monthly_usage WHERE month_year < ?1")
            .bind(month_year)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to purge monthly usage"))?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn insert_usage(&self, usage: &MonthlyUsage) -> Result<(), KeywardenError> {
        let sql = format!(
            "INSERT INTO monthly_usage ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            USAGE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&usage.id)
            .bind(&usage.api_key_id)
            .bind(&usage.account_id)
            .bind(&usage.month_year)
            .bind(usage.total_calls)
            .bind(usage.successful_calls)
            .bind(usage.failed_calls)
            .bind(usage.quota_exceeded_calls)
            .bind(usage.quota_limit)
            .bind(usage.grace_limit)
            .bind(format_date(usage.last_reset_date))
            .bind(usage.first_call_at.map(to_millis))
            .bind(usage.last_call_at.map(to_millis))
            .bind(to_millis(usage.created_at))
            .bind(to_millis(usage.updated_at))
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to insert monthly usage"))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// A January 2025 row with 10 calls against a quota of 100.
    pub fn january_usage(id: &str, api_key_id: &str) -> MonthlyUsage {
        let at = Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap();
        MonthlyUsage {
            id: id.to_string(),
            api_key_id: api_key_id.to_string(),
            account_id: "acct-1".to_string(),
            month_year: "2025-01".to_string(),
            total_calls: 10,
            successful_calls: 8,
            failed_calls: 1,
            quota_exceeded_calls: 1,
            quota_limit: 100,
            grace_limit: 110,
            last_reset_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            first_call_at: Some(at),
            last_call_at: Some(at),
            created_at: at,
            updated_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::january_usage;
    use super::*;
    use crate::model::usage::first_of_month;
    use chrono::TimeZone;

    fn call<'a>(outcome: CallOutcome, month_year: &'a str, now: DateTime<Utc>) -> CallRecord<'a> {
        CallRecord {
            api_key_id: "key-1",
            account_id: "acct-1",
            month_year,
            month_start: first_of_month(&now),
            outcome,
            now,
            default_quota: 1_000,
            default_grace: 1_100,
        }
    }

    fn feb(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, day, 10, 0, 0).unwrap()
    }

    fn feb_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_record_creates_row_with_defaults_then_increments() {
        let store = Store::in_memory().await.unwrap();

        let first = store
            .record_call(call(CallOutcome::Success, "2025-02", feb(3)))
            .await
            .unwrap();
        assert_eq!(first.total_calls, 1);
        assert_eq!(first.successful_calls, 1);
        assert_eq!(first.quota_limit, 1_000);
        assert_eq!(first.grace_limit, 1_100);

        let second = store
            .record_call(call(CallOutcome::Failure, "2025-02", feb(4)))
            .await
            .unwrap();
        assert_eq!(second.total_calls, 2);
        assert_eq!(second.failed_calls, 1);

        let row = store.find_usage("key-1", "2025-02").await.unwrap().unwrap();
        assert!(row.is_consistent());
        assert_eq!(row.first_call_at, Some(feb(3)));
        assert_eq!(row.last_call_at, Some(feb(4)));
    }

    #[tokio::test]
    async fn test_lazy_row_inherits_previous_month_limits() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_usage(&january_usage("u-jan", "key-1"))
            .await
            .unwrap();

        let snapshot = store
            .record_call(call(CallOutcome::Success, "2025-02", feb(2)))
            .await
            .unwrap();
        assert_eq!(snapshot.quota_limit, 100);
        assert_eq!(snapshot.grace_limit, 110);
    }

    #[tokio::test]
    async fn test_reset_moves_row_into_new_month() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_usage(&january_usage("u-jan", "key-1"))
            .await
            .unwrap();

        let applied = store
            .apply_monthly_reset("u-jan", "key-1", feb_first(), "2025-02", 500, 550, feb(1))
            .await
            .unwrap();
        assert_eq!(applied, ResetApplied::Reset);

        let row = store.find_usage("key-1", "2025-02").await.unwrap().unwrap();
        assert_eq!(row.id, "u-jan");
        assert_eq!(row.total_calls, 0);
        assert_eq!(row.quota_limit, 500);
        assert_eq!(row.grace_limit, 550);
        assert_eq!(row.last_reset_date, feb_first());
        assert!(row.first_call_at.is_none());

        // Guard makes the second application a no-op
        let again = store
            .apply_monthly_reset("u-jan", "key-1", feb_first(), "2025-02", 999, 999, feb(1))
            .await
            .unwrap();
        assert_eq!(again, ResetApplied::AlreadyReset);
        let row = store.find_usage("key-1", "2025-02").await.unwrap().unwrap();
        assert_eq!(row.quota_limit, 500);
    }

    #[tokio::test]
    async fn test_reset_merges_into_lazily_created_row() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_usage(&january_usage("u-jan", "key-1"))
            .await
            .unwrap();
        store
            .record_call(call(CallOutcome::Success, "2025-02", feb(1)))
            .await
            .unwrap();

        let applied = store
            .apply_monthly_reset("u-jan", "key-1", feb_first(), "2025-02", 500, 550, feb(1))
            .await
            .unwrap();
        assert_eq!(applied, ResetApplied::Merged);

        let history = store.usage_history("key-1").await.unwrap();
        assert_eq!(history.len(), 2);
        let (current, stale) = (&history[0], &history[1]);
        assert_eq!(current.month_year, "2025-02");
        assert_eq!(current.total_calls, 1);
        assert_eq!(current.quota_limit, 500);
        assert_eq!(stale.month_year, "2025-01");
        assert_eq!(stale.total_calls, 10);
        assert_eq!(stale.last_reset_date, feb_first());
    }

    #[tokio::test]
    async fn test_candidates_skip_history_and_paginate() {
        let store = Store::in_memory().await.unwrap();
        for (id, key) in [("u-a", "key-a"), ("u-b", "key-b"), ("u-c", "key-c")] {
            store.insert_usage(&january_usage(id, key)).await.unwrap();
        }
        // Older history row for key-a is not a candidate
        let mut december = january_usage("u-a-dec", "key-a");
        december.month_year = "2024-12".to_string();
        december.last_reset_date = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        store.insert_usage(&december).await.unwrap();

        let page = store
            .reset_candidates(feb_first(), "2025-02", "", 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u-a", "u-b"]);

        let page = store
            .reset_candidates(feb_first(), "2025-02", "u-b", 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "u-c");
    }

    #[tokio::test]
    async fn test_purge_before_keeps_recent_months() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_usage(&january_usage("u-jan", "key-1"))
            .await
            .unwrap();
        store
            .record_call(call(CallOutcome::Success, "2025-02", feb(2)))
            .await
            .unwrap();

        assert_eq!(store.purge_usage_before("2025-02").await.unwrap(), 1);
        assert!(store.find_usage("key-1", "2025-01").await.unwrap().is_none());
        assert!(store.find_usage("key-1", "2025-02").await.unwrap().is_some());
    }
}
