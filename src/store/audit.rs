//! `quota_reset_audit` queries.

use super::{db_error, format_date, from_millis, parse_date, to_millis, Store};
use crate::model::{ExecutionStatus, QuotaResetAuditRecord};
use crate::KeywardenError;

const AUDIT_COLUMNS: &str = "id, reset_date, month_year, records_processed, records_successful, \
     records_failed, records_skipped, duration_ms, triggered_by, status, error_message, \
     started_at, completed_at";

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    reset_date: String,
    month_year: String,
    records_processed: i64,
    records_successful: i64,
    records_failed: i64,
    records_skipped: i64,
    duration_ms: i64,
    triggered_by: String,
    status: String,
    error_message: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

impl AuditRow {
    fn into_record(self) -> Result<QuotaResetAuditRecord, KeywardenError> {
        Ok(QuotaResetAuditRecord {
            reset_date: parse_date(&self.reset_date)?,
            id: self.id,
            month_year: self.month_year,
            records_processed: count(self.records_processed),
            records_successful: count(self.records_successful),
            records_failed: count(self.records_failed),
            records_skipped: count(self.records_skipped),
            duration_ms: self.duration_ms,
            triggered_by: self.triggered_by,
            status: ExecutionStatus::from_stored(&self.status),
            error_message: self.error_message,
            started_at: from_millis(self.started_at),
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

fn count(stored: i64) -> u64 {
    u64::try_from(stored).unwrap_or_default()
}

fn stored(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl Store {
    /// Write the `STARTED` row of a reset run.
    pub async fn begin_reset_audit(
        &self,
        record: &QuotaResetAuditRecord,
    ) -> Result<(), KeywardenError> {
        sqlx::query(
            r#"
            INSERT INTO quota_reset_audit (id, reset_date, month_year, triggered_by, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.id)
        .bind(format_date(record.reset_date))
        .bind(&record.month_year)
        .bind(&record.triggered_by)
        .bind(ExecutionStatus::Started.as_str())
        .bind(to_millis(record.started_at))
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to write reset audit row"))?;
        Ok(())
    }

    /// Finalize a run's audit row. A row that already left `STARTED` is not touched.
    ///
    /// Returns whether the row was finalized by this call.
    pub async fn finalize_reset_audit(
        &self,
        record: &QuotaResetAuditRecord,
    ) -> Result<bool, KeywardenError> {
        let result = sqlx::query(
            r#"
            UPDATE quota_reset_audit SET
                records_processed = ?1,
                records_successful = ?2,
                records_failed = ?3,
                records_skipped = ?4,
                duration_ms = ?5,
                status = ?6,
                error_message = ?7,
                completed_at = ?8
            WHERE id = ?9 AND status = 'STARTED'
            "#,
        )
        .bind(stored(record.records_processed))
        .bind(stored(record.records_successful))
        .bind(stored(record.records_failed))
        .bind(stored(record.records_skipped))
        .bind(record.duration_ms)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.completed_at.map(to_millis))
        .bind(&record.id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to finalize reset audit row"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Load one audit row.
    pub async fn find_reset_audit(
        &self,
        id: &str,
    ) -> Result<Option<QuotaResetAuditRecord>, KeywardenError> {
        let sql = format!("SELECT {} FROM quota_reset_audit WHERE id = ?1", AUDIT_COLUMNS);
        sqlx::query_as::<_, AuditRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load reset audit row"))?
            .map(AuditRow::into_record)
            .transpose()
    }

    /// Most recent runs first.
    pub async fn recent_reset_audits(
        &self,
        limit: u32,
    ) -> Result<Vec<QuotaResetAuditRecord>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM quota_reset_audit ORDER BY started_at DESC, id DESC LIMIT ?1",
            AUDIT_COLUMNS
        );
        sqlx::query_as::<_, AuditRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list reset audit rows"))?
            .into_iter()
            .map(AuditRow::into_record)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    fn started() -> QuotaResetAuditRecord {
        QuotaResetAuditRecord {
            id: "run-1".to_string(),
            reset_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            month_year: "2025-02".to_string(),
            records_processed: 0,
            records_successful: 0,
            records_failed: 0,
            records_skipped: 0,
            duration_ms: 0,
            triggered_by: "SCHEDULED".to_string(),
            status: ExecutionStatus::Started,
            error_message: None,
            started_at: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_audit_row_is_finalized_once() {
        let store = Store::in_memory().await.unwrap();
        let mut record = started();
        store.begin_reset_audit(&record).await.unwrap();

        let loaded = store.find_reset_audit("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Started);
        assert!(loaded.completed_at.is_none());

        record.records_processed = 3;
        record.records_successful = 2;
        record.records_failed = 1;
        record.duration_ms = 42;
        record.status = ExecutionStatus::CompletedWithErrors;
        record.completed_at = Some(record.started_at + Duration::milliseconds(42));
        assert!(store.finalize_reset_audit(&record).await.unwrap());

        record.status = ExecutionStatus::Failed;
        assert!(!store.finalize_reset_audit(&record).await.unwrap());

        let loaded = store.find_reset_audit("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::CompletedWithErrors);
        assert_eq!(loaded.records_processed, 3);
        assert_eq!(loaded.records_failed, 1);
        assert_eq!(loaded.duration_ms, 42);
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let store = Store::in_memory().await.unwrap();
        let first = started();
        let mut second = started();
        second.id = "run-2".to_string();
        second.started_at = first.started_at + Duration::hours(1);
        store.begin_reset_audit(&first).await.unwrap();
        store.begin_reset_audit(&second).await.unwrap();

        let runs = store.recent_reset_audits(10).await.unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["run-2", "run-1"]);
    }
}
