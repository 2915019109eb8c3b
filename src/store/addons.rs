//! `add_on_grants` queries.

use super::{db_error, from_millis, to_millis, Store};
use crate::model::{AddOnGrant, AddOnPackage};
use crate::KeywardenError;
use chrono::{DateTime, Utc};

const GRANT_COLUMNS: &str = "id, api_key_id, account_id, package, additional_requests, \
     requests_used, active, activated_at, expires_at, auto_renew, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct GrantRow {
    id: String,
    api_key_id: String,
    account_id: String,
    package: String,
    additional_requests: i64,
    requests_used: i64,
    active: bool,
    activated_at: i64,
    expires_at: i64,
    auto_renew: bool,
    created_at: i64,
    updated_at: i64,
}

impl GrantRow {
    fn into_grant(self) -> Result<AddOnGrant, KeywardenError> {
        Ok(AddOnGrant {
            package: AddOnPackage::from_stored(&self.package, self.additional_requests)?,
            id: self.id,
            api_key_id: self.api_key_id,
            account_id: self.account_id,
            additional_requests: self.additional_requests,
            requests_used: self.requests_used,
            active: self.active,
            activated_at: from_millis(self.activated_at),
            expires_at: from_millis(self.expires_at),
            auto_renew: self.auto_renew,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct GrantCounts {
    unexpired: i64,
    consumable: i64,
}

impl Store {
    /// Persist a purchased grant.
    pub async fn insert_grant(&self, grant: &AddOnGrant) -> Result<(), KeywardenError> {
        let sql = format!(
            "INSERT INTO add_on_grants ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            GRANT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&grant.id)
            .bind(&grant.api_key_id)
            .bind(&grant.account_id)
            .bind(grant.package.as_str())
            .bind(grant.additional_requests)
            .bind(grant.requests_used)
            .bind(grant.active)
            .bind(to_millis(grant.activated_at))
            .bind(to_millis(grant.expires_at))
            .bind(grant.auto_renew)
            .bind(to_millis(grant.created_at))
            .bind(to_millis(grant.updated_at))
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to insert add-on grant"))?;
        Ok(())
    }

    /// Take `requests` from the oldest-activated grant with capacity left.
    ///
    /// One conditional UPDATE: the grant is chosen and debited in the same
    /// statement, and deactivated when the debit exhausts it. Returns the
    /// updated grant, or `None` when that grant cannot cover all of
    /// `requests`. Newer grants are not consulted.
    pub async fn consume_grant(
        &self,
        api_key_id: &str,
        requests: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<AddOnGrant>, KeywardenError> {
        let sql = format!(
            r#"
            UPDATE add_on_grants SET
                requests_used = requests_used + ?1,
                active = CASE WHEN requests_used + ?1 >= additional_requests THEN 0 ELSE 1 END,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM add_on_grants
                WHERE api_key_id = ?3
                  AND active = 1
                  AND activated_at <= ?2
                  AND expires_at > ?2
                  AND requests_used < additional_requests
                ORDER BY activated_at ASC, id ASC
                LIMIT 1
            )
              AND active = 1
              AND additional_requests - requests_used >= ?1
            RETURNING {}
            "#,
            GRANT_COLUMNS
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(requests)
            .bind(to_millis(now))
            .bind(api_key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to consume add-on capacity"))?
            .map(GrantRow::into_grant)
            .transpose()
    }

    /// All grants of a key, oldest activation first.
    pub async fn grants_for_key(&self, api_key_id: &str) -> Result<Vec<AddOnGrant>, KeywardenError> {
        let sql = format!(
            "SELECT {} FROM add_on_grants WHERE api_key_id = ?1 \
             ORDER BY activated_at ASC, id ASC",
            GRANT_COLUMNS
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(api_key_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list add-on grants"))?
            .into_iter()
            .map(GrantRow::into_grant)
            .collect()
    }

    /// Requests left across every consumable grant of a key.
    pub async fn remaining_add_on_capacity(
        &self,
        api_key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, KeywardenError> {
        let remaining: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(additional_requests - requests_used), 0)
            FROM add_on_grants
            WHERE api_key_id = ?1 AND active = 1 AND activated_at <= ?2 AND expires_at > ?2
            "#,
        )
        .bind(api_key_id)
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to sum add-on capacity"))?;
        Ok(remaining)
    }

    /// Whether the key has in-window grants and every one of them is used up.
    pub async fn has_depleted_grants(
        &self,
        api_key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, KeywardenError> {
        let counts = sqlx::query_as::<_, GrantCounts>(
            r#"
            SELECT
                COUNT(*) AS unexpired,
                COALESCE(SUM(CASE WHEN active = 1 AND requests_used < additional_requests
                    THEN 1 ELSE 0 END), 0) AS consumable
            FROM add_on_grants
            WHERE api_key_id = ?1 AND activated_at <= ?2 AND expires_at > ?2
            "#,
        )
        .bind(api_key_id)
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to inspect add-on grants"))?;

        Ok(counts.unexpired > 0 && counts.consumable == 0)
    }

    /// Deactivate grants whose validity window has closed and return them.
    pub async fn expire_grants(&self, now: DateTime<Utc>) -> Result<Vec<AddOnGrant>, KeywardenError> {
        let sql = format!(
            "UPDATE add_on_grants SET active = 0, updated_at = ?1 \
             WHERE active = 1 AND expires_at <= ?1 RETURNING {}",
            GRANT_COLUMNS
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to expire add-on grants"))?
            .into_iter()
            .map(GrantRow::into_grant)
            .collect()
    }
}
