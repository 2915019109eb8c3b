//! Monthly quota accounting.
//!
//! Every call is counted by one upsert on the key's row for the current
//! month. Admission compares the month's count with the quota, then spends
//! purchased add-on capacity, then the grace band, before rejecting.

use crate::client::{dispatch, Notification, Notifier};
use crate::clock::Clock;
use crate::config::KeywardenConfig;
use crate::model::usage::{first_of_month, first_of_next_month, format_month, grace_limit_for};
use crate::model::{ApiKeyRecord, CallOutcome, QuotaStatus, UsageSnapshot, UNLIMITED};
use crate::store::{CallRecord, Store};
use crate::KeywardenError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a quota admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    /// Below the monthly quota.
    Within(QuotaStatus),
    /// Over quota, admitted by consuming one add-on request.
    AddOn {
        /// Quota position before this call.
        status: QuotaStatus,
        /// Grant that was debited.
        grant_id: String,
        /// Requests left on that grant.
        grant_remaining: i64,
    },
    /// Over quota, admitted inside the grace band.
    Grace(QuotaStatus),
}

impl QuotaDecision {
    /// Quota position the decision was made on.
    pub fn status(&self) -> &QuotaStatus {
        match self {
            Self::Within(status) | Self::Grace(status) => status,
            Self::AddOn { status, .. } => status,
        }
    }

    /// Overage label for admitted over-quota calls.
    pub fn overage(&self) -> Option<&'static str> {
        match self {
            Self::Within(_) => None,
            Self::AddOn { .. } => Some("add-on"),
            Self::Grace(_) => Some("grace"),
        }
    }
}

/// Counts calls per key and month and decides quota admission.
#[derive(Clone)]
pub struct QuotaAccountant {
    store: Store,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    default_quota: i64,
    grace_percent: u32,
    warning_percent: u32,
}

impl QuotaAccountant {
    /// Create an accountant using the configured defaults and thresholds.
    pub fn new(
        config: &KeywardenConfig,
        store: Store,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            default_quota: config.default_monthly_quota,
            grace_percent: config.grace_percent,
            warning_percent: config.quota_warning_percent,
        }
    }

    /// Count one call for the current month and return the post-update counters.
    ///
    /// Fires `QuotaWarning` and `QuotaExhausted` notifications on the exact
    /// call that crosses each threshold.
    pub async fn record(
        &self,
        api_key_id: &str,
        account_id: &str,
        outcome: CallOutcome,
    ) -> Result<UsageSnapshot, KeywardenError> {
        let now = self.clock.now_utc();
        let month_year = format_month(&now);

        let snapshot = self
            .store
            .record_call(CallRecord {
                api_key_id,
                account_id,
                month_year: &month_year,
                month_start: first_of_month(&now),
                outcome,
                now,
                default_quota: self.default_quota,
                default_grace: self.default_grace(),
            })
            .await?;

        debug!(
            key_id = api_key_id,
            month_year = %month_year,
            total = snapshot.total_calls,
            ?outcome,
            "Usage recorded"
        );
        self.notify_thresholds(api_key_id, account_id, &month_year, &snapshot);
        Ok(snapshot)
    }

    /// Record an outcome in the background. Failures are logged and dropped.
    pub fn record_in_background(&self, api_key_id: &str, account_id: &str, outcome: CallOutcome) {
        let accountant = self.clone();
        let api_key_id = api_key_id.to_string();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = accountant.record(&api_key_id, &account_id, outcome).await {
                warn!(key_id = %api_key_id, account_id = %account_id, error = %e, "Failed to record usage");
            }
        });
    }

    /// Quota position of a key for the current month.
    pub async fn check_quota(&self, api_key_id: &str) -> Result<QuotaStatus, KeywardenError> {
        let now = self.clock.now_utc();
        let month_year = format_month(&now);

        let (quota_limit, grace_limit, used) =
            match self.store.find_usage(api_key_id, &month_year).await? {
                Some(usage) => (usage.quota_limit, usage.grace_limit, usage.total_calls),
                None => match self.store.latest_usage(api_key_id).await? {
                    Some(previous) => (previous.quota_limit, previous.grace_limit, 0),
                    None => (self.default_quota, self.default_grace(), 0),
                },
            };

        Ok(QuotaStatus::compute(
            month_year,
            quota_limit,
            grace_limit,
            used,
            first_of_next_month(&now),
        ))
    }

    /// Debit `requests` from the oldest add-on grant that still has capacity.
    ///
    /// Returns false when that grant cannot cover all of `requests`; a newer
    /// grant is never touched while an older one has room.
    pub async fn consume_add_on(
        &self,
        api_key_id: &str,
        requests: i64,
    ) -> Result<bool, KeywardenError> {
        Ok(self
            .store
            .consume_grant(api_key_id, requests, self.clock.now_utc())
            .await?
            .is_some())
    }

    /// Decide whether the key may make one more call this month.
    ///
    /// Rejections are recorded as `QuotaExceeded` in the background.
    ///
    /// # Errors
    /// - `AddOnDepleted` - over quota and every unexpired add-on grant is used up
    /// - `GraceExceeded` - over quota and past the grace band
    /// - `QuotaExceeded` - over quota with no grace band
    pub async fn evaluate(&self, key: &ApiKeyRecord) -> Result<QuotaDecision, KeywardenError> {
        let status = self.check_quota(&key.id).await?;
        if !status.is_exceeded {
            return Ok(QuotaDecision::Within(status));
        }

        let now = self.clock.now_utc();
        if let Some(grant) = self.store.consume_grant(&key.id, 1, now).await? {
            debug!(key_id = %key.id, grant_id = %grant.id, remaining = grant.requests_remaining(), "Add-on capacity consumed");
            return Ok(QuotaDecision::AddOn {
                status,
                grant_id: grant.id.clone(),
                grant_remaining: grant.requests_remaining(),
            });
        }

        if status.has_grace_band() && !status.is_grace_exceeded {
            warn!(
                key_id = %key.id,
                account_id = %key.account_id,
                used = status.used,
                quota_limit = status.quota_limit,
                grace_limit = status.grace_limit,
                "Admitting call in grace band"
            );
            return Ok(QuotaDecision::Grace(status));
        }

        let rejection = if self.store.has_depleted_grants(&key.id, now).await? {
            KeywardenError::AddOnDepleted
        } else if status.has_grace_band() {
            KeywardenError::GraceExceeded {
                grace_limit: status.grace_limit,
                used: status.used,
            }
        } else {
            KeywardenError::QuotaExceeded {
                limit: status.quota_limit,
                used: status.used,
            }
        };

        warn!(key_id = %key.id, account_id = %key.account_id, error = %rejection, "Quota rejection");
        self.record_in_background(&key.id, &key.account_id, CallOutcome::QuotaExceeded);
        Err(rejection)
    }

    /// Retention cleanup: delete usage rows for months before `month_year`.
    pub async fn purge_before(&self, month_year: &str) -> Result<u64, KeywardenError> {
        self.store.purge_usage_before(month_year).await
    }

    /// Grace limit for rows created from the configured default quota.
    fn default_grace(&self) -> i64 {
        grace_limit_for(self.default_quota, self.grace_percent).unwrap_or(i64::MAX)
    }

    fn notify_thresholds(
        &self,
        api_key_id: &str,
        account_id: &str,
        month_year: &str,
        snapshot: &UsageSnapshot,
    ) {
        let limit = snapshot.quota_limit;
        if limit == UNLIMITED || limit <= 0 {
            return;
        }

        let warning_at =
            i64::try_from((i128::from(limit) * i128::from(self.warning_percent) + 99) / 100)
                .unwrap_or(limit);
        if warning_at < limit && snapshot.total_calls == warning_at {
            dispatch(
                &self.notifier,
                Notification::QuotaWarning {
                    api_key_id: api_key_id.to_string(),
                    account_id: account_id.to_string(),
                    month_year: month_year.to_string(),
                    used: snapshot.total_calls,
                    quota_limit: limit,
                    threshold_percent: self.warning_percent,
                },
            );
        }

        if snapshot.total_calls == limit {
            dispatch(
                &self.notifier,
                Notification::QuotaExhausted {
                    api_key_id: api_key_id.to_string(),
                    account_id: account_id.to_string(),
                    month_year: month_year.to_string(),
                    quota_limit: limit,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingNotifier;
    use crate::clock::MockClock;
    use crate::model::key::fixtures::key_record;
    use crate::model::{AddOnGrant, AddOnPackage};
    use chrono::Duration;

    struct Fixture {
        accountant: QuotaAccountant,
        clock: Arc<MockClock>,
        store: Store,
        notifier: Arc<RecordingNotifier>,
    }

    async fn fixture(default_quota: i64, grace_percent: u32) -> Fixture {
        let store = Store::in_memory().await.unwrap();
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        let notifier = Arc::new(RecordingNotifier::default());
        let config = KeywardenConfig {
            default_monthly_quota: default_quota,
            grace_percent,
            ..KeywardenConfig::default()
        };
        let accountant =
            QuotaAccountant::new(&config, store.clone(), clock.clone(), notifier.clone());
        Fixture {
            accountant,
            clock,
            store,
            notifier,
        }
    }

    async fn spend(f: &Fixture, calls: usize) {
        for _ in 0..calls {
            f.accountant
                .record("key-1", "acct-1", CallOutcome::Success)
                .await
                .unwrap();
        }
    }

    fn grant(f: &Fixture, id: &str, size: i64) -> AddOnGrant {
        let now = f.clock.now_utc();
        AddOnGrant {
            id: id.to_string(),
            api_key_id: "key-1".to_string(),
            account_id: "acct-1".to_string(),
            package: AddOnPackage::Custom(size),
            additional_requests: size,
            requests_used: 0,
            active: true,
            activated_at: now - Duration::days(1),
            expires_at: now + Duration::days(29),
            auto_renew: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_quota_boundary() {
        let f = fixture(10, 0).await;
        spend(&f, 9).await;
        let status = f.accountant.check_quota("key-1").await.unwrap();
        assert!(!status.is_exceeded);
        assert_eq!(status.remaining, Some(1));

        spend(&f, 1).await;
        let status = f.accountant.check_quota("key-1").await.unwrap();
        assert!(status.is_exceeded);
        assert_eq!(status.used, 10);
        assert_eq!(status.month_year, "2025-01");
        assert_eq!(status.resets_at.to_rfc3339(), "2025-02-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_check_without_usage_uses_defaults() {
        let f = fixture(500, 10).await;
        let status = f.accountant.check_quota("key-1").await.unwrap();
        assert_eq!(status.quota_limit, 500);
        assert_eq!(status.grace_limit, 550);
        assert_eq!(status.used, 0);
    }

    #[tokio::test]
    async fn test_outcomes_are_tallied() {
        let f = fixture(100, 0).await;
        for outcome in [CallOutcome::Success, CallOutcome::Failure, CallOutcome::QuotaExceeded] {
            f.accountant.record("key-1", "acct-1", outcome).await.unwrap();
        }
        let row = f.store.find_usage("key-1", "2025-01").await.unwrap().unwrap();
        assert_eq!(row.total_calls, 3);
        assert_eq!(
            (row.successful_calls, row.failed_calls, row.quota_exceeded_calls),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn test_new_month_starts_from_zero() {
        let f = fixture(10, 0).await;
        spend(&f, 10).await;
        f.clock.advance(Duration::days(20));

        let status = f.accountant.check_quota("key-1").await.unwrap();
        assert_eq!(status.month_year, "2025-02");
        assert_eq!(status.used, 0);
        assert!(!status.is_exceeded);
    }

    #[tokio::test]
    async fn test_within_then_grace_then_rejection() {
        let f = fixture(10, 20).await;
        let key = key_record();
        spend(&f, 10).await;

        let decision = f.accountant.evaluate(&key).await.unwrap();
        assert!(matches!(decision, QuotaDecision::Grace(_)));
        assert_eq!(decision.overage(), Some("grace"));

        spend(&f, 2).await;
        assert!(matches!(
            f.accountant.evaluate(&key).await,
            Err(KeywardenError::GraceExceeded { grace_limit: 12, used: 12 })
        ));
    }

    #[tokio::test]
    async fn test_hard_quota_without_grace() {
        let f = fixture(5, 0).await;
        let key = key_record();
        spend(&f, 4).await;
        assert!(matches!(
            f.accountant.evaluate(&key).await.unwrap(),
            QuotaDecision::Within(_)
        ));

        spend(&f, 1).await;
        assert!(matches!(
            f.accountant.evaluate(&key).await,
            Err(KeywardenError::QuotaExceeded { limit: 5, used: 5 })
        ));

        // The rejection itself is counted in the background
        let mut rejected = 0;
        for _ in 0..50 {
            rejected = f
                .store
                .find_usage("key-1", "2025-01")
                .await
                .unwrap()
                .map(|u| u.quota_exceeded_calls)
                .unwrap_or(0);
            if rejected == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn test_add_on_precedes_grace_and_depletes() {
        let f = fixture(5, 0).await;
        let key = key_record();
        f.store.insert_grant(&grant(&f, "g1", 2)).await.unwrap();
        spend(&f, 5).await;

        for expected_remaining in [1, 0] {
            match f.accountant.evaluate(&key).await.unwrap() {
                QuotaDecision::AddOn {
                    grant_id,
                    grant_remaining,
                    ..
                } => {
                    assert_eq!(grant_id, "g1");
                    assert_eq!(grant_remaining, expected_remaining);
                }
                other => panic!("expected add-on admission, got {:?}", other),
            }
            spend(&f, 1).await;
        }

        assert!(matches!(
            f.accountant.evaluate(&key).await,
            Err(KeywardenError::AddOnDepleted)
        ));
    }

    #[tokio::test]
    async fn test_consume_add_on_direct() {
        let f = fixture(5, 0).await;
        f.store.insert_grant(&grant(&f, "g1", 3)).await.unwrap();
        assert!(f.accountant.consume_add_on("key-1", 3).await.unwrap());
        assert!(!f.accountant.consume_add_on("key-1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlimited_quota_is_never_exceeded() {
        let f = fixture(UNLIMITED, 10).await;
        let key = key_record();
        spend(&f, 50).await;
        let decision = f.accountant.evaluate(&key).await.unwrap();
        assert!(matches!(decision, QuotaDecision::Within(ref s) if s.remaining.is_none()));
    }

    #[tokio::test]
    async fn test_threshold_notifications_fire_once() {
        let f = fixture(10, 0).await;
        spend(&f, 12).await;

        let sent = f.notifier.wait_for(2).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(f.notifier.sent().len(), 2);

        assert!(sent.iter().any(|n| matches!(
            n,
            Notification::QuotaWarning { used: 8, threshold_percent: 80, .. }
        )));
        assert!(sent
            .iter()
            .any(|n| matches!(n, Notification::QuotaExhausted { quota_limit: 10, .. })));
    }

    #[tokio::test]
    async fn test_purge_before() {
        let f = fixture(10, 0).await;
        spend(&f, 1).await;
        f.clock.advance(Duration::days(40));
        spend(&f, 1).await;

        assert_eq!(f.accountant.purge_before("2025-02").await.unwrap(), 1);
    }
}
