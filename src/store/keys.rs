//! `api_keys` queries.

use super::{db_error, from_millis, join_list, split_list, to_millis, Store};
use crate::model::{ApiKeyRecord, ApiScope, RateLimitTier};
use crate::KeywardenError;
use chrono::{DateTime, Utc};

const KEY_COLUMNS: &str = "id, key_hash, key_prefix, name, account_id, active, expires_at, \
     revoked_at, registered_domain, allowed_ips, allowed_domains, rate_limit_tier, scopes, \
     created_at, updated_at, last_used_at";

#[derive(sqlx::FromRow)]
struct KeyRow {
    id: String,
    key_hash: String,
    key_prefix: String,
    name: String,
    account_id: String,
    active: bool,
    expires_at: Option<i64>,
    revoked_at: Option<i64>,
    registered_domain: Option<String>,
    allowed_ips: String,
    allowed_domains: String,
    rate_limit_tier: String,
    scopes: String,
    created_at: i64,
    updated_at: i64,
    last_used_at: Option<i64>,
}

impl KeyRow {
    fn into_record(self) -> Result<ApiKeyRecord, KeywardenError> {
        let tier: RateLimitTier = self.rate_limit_tier.parse()?;
        let scopes = split_list(&self.scopes)
            .iter()
            .map(|s| s.parse::<ApiScope>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ApiKeyRecord {
            id: self.id,
            key_hash: self.key_hash,
            key_prefix: self.key_prefix,
            name: self.name,
            account_id: self.account_id,
            active: self.active,
            expires_at: self.expires_at.map(from_millis),
            revoked_at: self.revoked_at.map(from_millis),
            registered_domain: self.registered_domain,
            allowed_ips: split_list(&self.allowed_ips),
            allowed_domains: split_list(&self.allowed_domains),
            tier,
            scopes,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            last_used_at: self.last_used_at.map(from_millis),
        })
    }
}

impl Store {
    /// Persist a newly issued key.
    pub async fn insert_key(&self, key: &ApiKeyRecord) -> Result<(), KeywardenError> {
        let scopes: Vec<&str> = key.scopes.iter().map(ApiScope::as_str).collect();

        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, key_hash, key_prefix, name, account_id, active, expires_at, revoked_at,
                registered_domain, allowed_ips, allowed_domains, rate_limit_tier, scopes,
                created_at, updated_at, last_used_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(&key.account_id)
        .bind(key.active)
        .bind(key.expires_at.map(to_millis))
        .bind(key.revoked_at.map(to_millis))
        .bind(&key.registered_domain)
        .bind(join_list(&key.allowed_ips))
        .bind(join_list(&key.allowed_domains))
        .bind(key.tier.as_str())
        .bind(join_list(&scopes))
        .bind(to_millis(key.created_at))
        .bind(to_millis(key.updated_at))
        .bind(key.last_used_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to insert API key"))?;

        Ok(())
    }

    /// Look up a key by the hash of its raw secret.
    pub async fn find_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, KeywardenError> {
        let sql = format!("SELECT {} FROM api_keys WHERE key_hash = ?1", KEY_COLUMNS);
        sqlx::query_as::<_, KeyRow>(&sql)
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to look up API key"))?
            .map(KeyRow::into_record)
            .transpose()
    }

    /// Look up a key by id.
    pub async fn find_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, KeywardenError> {
        let sql = format!("SELECT {} FROM api_keys WHERE id = ?1", KEY_COLUMNS);
        sqlx::query_as::<_, KeyRow>(&sql)
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load API key"))?
            .map(KeyRow::into_record)
            .transpose()
    }

    /// All keys of an account, oldest first.
    pub async fn list_keys_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<ApiKeyRecord>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM api_keys WHERE account_id = ?1 ORDER BY created_at ASC, id ASC",
            KEY_COLUMNS
        );
        sqlx::query_as::<_, KeyRow>(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list API keys"))?
            .into_iter()
            .map(KeyRow::into_record)
            .collect()
    }

    /// Stamp `last_used_at`.
    pub async fn touch_key_last_used(
        &self,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), KeywardenError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2")
            .bind(to_millis(at))
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to update last_used_at"))?;
        Ok(())
    }

    /// Mark a key revoked. An earlier revocation time is kept.
    ///
    /// Returns false when no key has the id.
    pub async fn revoke_key(&self, key_id: &str, at: DateTime<Utc>) -> Result<bool, KeywardenError> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = COALESCE(revoked_at, ?1), updated_at = ?1 WHERE id = ?2",
        )
        .bind(to_millis(at))
        .bind(key_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to revoke API key"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the activity flag.
    pub async fn set_key_active(
        &self,
        key_id: &str,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, KeywardenError> {
        let result = sqlx::query("UPDATE api_keys SET active = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(active)
            .bind(to_millis(at))
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to update API key status"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear the expiry time.
    pub async fn set_key_expiry(
        &self,
        key_id: &str,
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, KeywardenError> {
        let result =
            sqlx::query("UPDATE api_keys SET expires_at = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(expires_at.map(to_millis))
                .bind(to_millis(at))
                .bind(key_id)
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to update API key expiry"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Swap in the hash of a new secret, invalidating the old one.
    pub async fn replace_key_hash(
        &self,
        key_id: &str,
        key_hash: &str,
        key_prefix: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, KeywardenError> {
        let result = sqlx::query(
            "UPDATE api_keys SET key_hash = ?1, key_prefix = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(key_hash)
        .bind(key_prefix)
        .bind(to_millis(at))
        .bind(key_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to rotate API key"))?;
        Ok(result.rows_affected() > 0)
    }
}
