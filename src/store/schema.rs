//! Idempotent schema creation.

use super::db_error;
use crate::KeywardenError;
use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id                TEXT PRIMARY KEY,
        key_hash          TEXT NOT NULL UNIQUE,
        key_prefix        TEXT NOT NULL,
        name              TEXT NOT NULL,
        account_id        TEXT NOT NULL,
        active            INTEGER NOT NULL DEFAULT 1,
        expires_at        INTEGER,
        revoked_at        INTEGER,
        registered_domain TEXT,
        allowed_ips       TEXT NOT NULL DEFAULT '',
        allowed_domains   TEXT NOT NULL DEFAULT '',
        rate_limit_tier   TEXT NOT NULL,
        scopes            TEXT NOT NULL DEFAULT '',
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL,
        last_used_at      INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_api_keys_account ON api_keys (account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS rate_limit_windows (
        key_hash      TEXT PRIMARY KEY,
        window_start  INTEGER NOT NULL,
        window_end    INTEGER NOT NULL,
        request_count INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS monthly_usage (
        id                   TEXT PRIMARY KEY,
        api_key_id           TEXT NOT NULL,
        account_id           TEXT NOT NULL,
        month_year           TEXT NOT NULL,
        total_calls          INTEGER NOT NULL DEFAULT 0,
        successful_calls     INTEGER NOT NULL DEFAULT 0,
        failed_calls         INTEGER NOT NULL DEFAULT 0,
        quota_exceeded_calls INTEGER NOT NULL DEFAULT 0,
        quota_limit          INTEGER NOT NULL,
        grace_limit          INTEGER NOT NULL,
        last_reset_date      TEXT NOT NULL,
        first_call_at        INTEGER,
        last_call_at         INTEGER,
        created_at           INTEGER NOT NULL,
        updated_at           INTEGER NOT NULL,
        UNIQUE (api_key_id, month_year)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_monthly_usage_reset ON monthly_usage (last_reset_date, id)",
    r#"
    CREATE TABLE IF NOT EXISTS add_on_grants (
        id                  TEXT PRIMARY KEY,
        api_key_id          TEXT NOT NULL,
        account_id          TEXT NOT NULL,
        package             TEXT NOT NULL,
        additional_requests INTEGER NOT NULL,
        requests_used       INTEGER NOT NULL DEFAULT 0,
        active              INTEGER NOT NULL DEFAULT 1,
        activated_at        INTEGER NOT NULL,
        expires_at          INTEGER NOT NULL,
        auto_renew          INTEGER NOT NULL DEFAULT 0,
        created_at          INTEGER NOT NULL,
        updated_at          INTEGER NOT NULL,
        CHECK (requests_used >= 0 AND requests_used <= additional_requests)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_add_on_grants_key ON add_on_grants (api_key_id, activated_at)",
    "CREATE INDEX IF NOT EXISTS idx_add_on_grants_expiry ON add_on_grants (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS quota_reset_audit (
        id                 TEXT PRIMARY KEY,
        reset_date         TEXT NOT NULL,
        month_year         TEXT NOT NULL,
        records_processed  INTEGER NOT NULL DEFAULT 0,
        records_successful INTEGER NOT NULL DEFAULT 0,
        records_failed     INTEGER NOT NULL DEFAULT 0,
        records_skipped    INTEGER NOT NULL DEFAULT 0,
        duration_ms        INTEGER NOT NULL DEFAULT 0,
        triggered_by       TEXT NOT NULL,
        status             TEXT NOT NULL,
        error_message      TEXT,
        started_at         INTEGER NOT NULL,
        completed_at       INTEGER
    )
    "#,
];

pub(super) async fn apply(pool: &SqlitePool) -> Result<(), KeywardenError> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(db_error("Failed to apply schema"))?;
    }
    Ok(())
}
