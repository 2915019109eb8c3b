//! Add-on ledger: purchased overflow capacity per key.

use crate::client::{dispatch, Notification, Notifier};
use crate::clock::Clock;
use crate::model::{AddOnGrant, AddOnPackage, ApiKeyRecord};
use crate::store::Store;
use crate::KeywardenError;
use chrono::Duration;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Registers, lists, and expires add-on grants.
#[derive(Clone)]
pub struct AddOnLedger {
    store: Store,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl AddOnLedger {
    /// Create a ledger over the given store.
    pub fn new(store: Store, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            clock,
            notifier,
        }
    }

    /// Register purchased capacity for a key, valid from now for `valid_for`.
    pub async fn grant(
        &self,
        key: &ApiKeyRecord,
        package: AddOnPackage,
        valid_for: Duration,
        auto_renew: bool,
    ) -> Result<AddOnGrant, KeywardenError> {
        let additional_requests = package.additional_requests();
        if additional_requests <= 0 {
            return Err(KeywardenError::UnknownPackage(package.to_string()));
        }
        if valid_for <= Duration::zero() {
            return Err(KeywardenError::ConfigError(format!(
                "Add-on validity must be positive, got {}s",
                valid_for.num_seconds()
            )));
        }

        let now = self.clock.now_utc();
        let grant = AddOnGrant {
            id: Uuid::new_v4().to_string(),
            api_key_id: key.id.clone(),
            account_id: key.account_id.clone(),
            package,
            additional_requests,
            requests_used: 0,
            active: true,
            activated_at: now,
            expires_at: now + valid_for,
            auto_renew,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_grant(&grant).await?;

        info!(
            key_id = %key.id,
            grant_id = %grant.id,
            package = %package,
            expires_at = %grant.expires_at,
            "Add-on granted"
        );
        Ok(grant)
    }

    /// Every grant of a key, oldest first.
    pub async fn list_for_key(&self, api_key_id: &str) -> Result<Vec<AddOnGrant>, KeywardenError> {
        self.store.grants_for_key(api_key_id).await
    }

    /// Requests left across the key's consumable grants.
    pub async fn remaining_capacity(&self, api_key_id: &str) -> Result<i64, KeywardenError> {
        self.store
            .remaining_add_on_capacity(api_key_id, self.clock.now_utc())
            .await
    }

    /// Deactivate grants past their expiry and notify about each one.
    ///
    /// Auto-renew grants are flagged in the notification; renewal itself
    /// is up to the billing side.
    pub async fn sweep_expired(&self) -> Result<Vec<AddOnGrant>, KeywardenError> {
        let expired = self.store.expire_grants(self.clock.now_utc()).await?;

        for grant in &expired {
            if grant.auto_renew {
                info!(grant_id = %grant.id, key_id = %grant.api_key_id, "Add-on expired, renewal requested");
            }
            dispatch(
                &self.notifier,
                Notification::AddOnExpired {
                    grant_id: grant.id.clone(),
                    api_key_id: grant.api_key_id.clone(),
                    account_id: grant.account_id.clone(),
                    package: grant.package.to_string(),
                    requests_remaining: grant.requests_remaining(),
                    auto_renew: grant.auto_renew,
                },
            );
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired add-on grants swept");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingNotifier;
    use crate::clock::MockClock;
    use crate::model::key::fixtures::key_record;

    async fn ledger() -> (AddOnLedger, Arc<MockClock>, Arc<RecordingNotifier>) {
        let store = Store::in_memory().await.unwrap();
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let notifier = Arc::new(RecordingNotifier::default());
        (
            AddOnLedger::new(store, clock.clone(), notifier.clone()),
            clock,
            notifier,
        )
    }

    #[tokio::test]
    async fn test_grant_and_capacity() {
        let (ledger, _, _) = ledger().await;
        let key = key_record();

        let grant = ledger
            .grant(&key, AddOnPackage::Starter, Duration::days(30), false)
            .await
            .unwrap();
        assert_eq!(grant.additional_requests, 1_000);
        assert!(grant.active);

        ledger
            .grant(&key, AddOnPackage::Custom(250), Duration::days(7), true)
            .await
            .unwrap();
        assert_eq!(ledger.remaining_capacity("key-1").await.unwrap(), 1_250);
        assert_eq!(ledger.list_for_key("key-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_grants() {
        let (ledger, _, _) = ledger().await;
        let key = key_record();

        assert!(matches!(
            ledger
                .grant(&key, AddOnPackage::Custom(0), Duration::days(30), false)
                .await,
            Err(KeywardenError::UnknownPackage(_))
        ));
        assert!(matches!(
            ledger
                .grant(&key, AddOnPackage::Growth, Duration::zero(), false)
                .await,
            Err(KeywardenError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_expired_notifies() {
        let (ledger, clock, notifier) = ledger().await;
        let key = key_record();
        ledger
            .grant(&key, AddOnPackage::Starter, Duration::days(1), true)
            .await
            .unwrap();
        ledger
            .grant(&key, AddOnPackage::Growth, Duration::days(30), false)
            .await
            .unwrap();

        assert!(ledger.sweep_expired().await.unwrap().is_empty());

        clock.advance(Duration::days(2));
        let expired = ledger.sweep_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].package, AddOnPackage::Starter);
        assert_eq!(ledger.remaining_capacity("key-1").await.unwrap(), 10_000);

        let sent = notifier.wait_for(1).await;
        assert!(matches!(
            &sent[0],
            Notification::AddOnExpired { auto_renew: true, requests_remaining: 1_000, .. }
        ));

        // Already deactivated grants are not swept twice
        assert!(ledger.sweep_expired().await.unwrap().is_empty());
    }
}
