//! Fixed-window rate limiting per key hash.

use crate::clock::Clock;
use crate::model::RateLimitTier;
use crate::store::{Store, WindowState};
use crate::KeywardenError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rate-limit position of a key after (or without) counting a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Tier applied.
    pub tier: RateLimitTier,
    /// Request ceiling per window (`None` = unlimited).
    pub limit: Option<u64>,
    /// Requests left in the window (`None` = unlimited).
    pub remaining: Option<u64>,
    /// Requests counted in the current window.
    pub request_count: u64,
    /// When the current window closes, if one is open.
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    fn unlimited(tier: RateLimitTier) -> Self {
        Self {
            tier,
            limit: None,
            remaining: None,
            request_count: 0,
            resets_at: None,
        }
    }

    fn from_window(tier: RateLimitTier, limit: u64, window: Option<&WindowState>) -> Self {
        let request_count = window
            .map(|w| u64::try_from(w.request_count).unwrap_or_default())
            .unwrap_or(0);
        Self {
            tier,
            limit: Some(limit),
            remaining: Some(limit.saturating_sub(request_count)),
            request_count,
            resets_at: window.map(|w| w.window_end),
        }
    }
}

/// Seconds until `until`, rounded up and at least one.
pub fn retry_after_seconds(now: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let millis = (until - now).num_milliseconds().max(0);
    ((millis + 999) / 1000).max(1)
}

/// Enforces the per-tier request ceiling.
#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count one request and enforce the tier's ceiling.
    ///
    /// The window update is a single atomic upsert; unlimited keys never
    /// touch storage.
    ///
    /// # Errors
    /// - `RateLimitExceeded` - the post-update count is above the ceiling
    pub async fn check(
        &self,
        key_hash: &str,
        tier: RateLimitTier,
    ) -> Result<RateLimitStatus, KeywardenError> {
        let Some(limit) = tier.request_limit() else {
            return Ok(RateLimitStatus::unlimited(tier));
        };

        let now = self.clock.now_utc();
        let window = self
            .store
            .hit_window(key_hash, now, tier.window_seconds())
            .await?;
        let status = RateLimitStatus::from_window(tier, limit, Some(&window));

        if status.request_count > limit {
            let retry_after = retry_after_seconds(now, window.window_end);
            warn!(tier = %tier, limit, retry_after, "Rate limit exceeded");
            return Err(KeywardenError::RateLimitExceeded {
                limit,
                retry_after_seconds: retry_after,
            });
        }

        debug!(tier = %tier, count = status.request_count, limit, "Rate limit window incremented");
        Ok(status)
    }

    /// Current status without counting a request.
    pub async fn peek(
        &self,
        key_hash: &str,
        tier: RateLimitTier,
    ) -> Result<RateLimitStatus, KeywardenError> {
        let Some(limit) = tier.request_limit() else {
            return Ok(RateLimitStatus::unlimited(tier));
        };

        let now = self.clock.now_utc();
        let window = self
            .store
            .find_window(key_hash)
            .await?
            .filter(|w| now < w.window_end);
        Ok(RateLimitStatus::from_window(tier, limit, window.as_ref()))
    }

    /// Delete windows that have closed. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, KeywardenError> {
        self.store.purge_expired_windows(self.clock.now_utc()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::Duration;

    async fn limiter() -> (RateLimiter, Arc<MockClock>, Store) {
        let store = Store::in_memory().await.unwrap();
        let clock = Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z"));
        (RateLimiter::new(store.clone(), clock.clone()), clock, store)
    }

    #[tokio::test]
    async fn test_ceiling_is_enforced() {
        let (limiter, _, _) = limiter().await;
        for n in 1..=100u64 {
            let status = limiter.check("h", RateLimitTier::Basic).await.unwrap();
            assert_eq!(status.request_count, n);
            assert_eq!(status.remaining, Some(100 - n));
        }

        match limiter.check("h", RateLimitTier::Basic).await {
            Err(KeywardenError::RateLimitExceeded {
                limit,
                retry_after_seconds,
            }) => {
                assert_eq!(limit, 100);
                assert_eq!(retry_after_seconds, 86_400);
            }
            other => panic!("expected RateLimitExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_rollover_resets_count() {
        let (limiter, clock, _) = limiter().await;
        for _ in 0..3 {
            limiter.check("h", RateLimitTier::Standard).await.unwrap();
        }

        clock.advance(Duration::hours(1));
        let status = limiter.check("h", RateLimitTier::Standard).await.unwrap();
        assert_eq!(status.request_count, 1);
        assert_eq!(status.resets_at, Some(clock.now_utc() + Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let (limiter, clock, _) = limiter().await;
        for _ in 0..100 {
            limiter.check("h", RateLimitTier::Basic).await.unwrap();
        }
        clock.advance(Duration::hours(23) + Duration::milliseconds(500));

        assert!(matches!(
            limiter.check("h", RateLimitTier::Basic).await,
            Err(KeywardenError::RateLimitExceeded { retry_after_seconds: 3600, .. })
        ));
    }

    #[tokio::test]
    async fn test_unlimited_never_writes() {
        let (limiter, _, store) = limiter().await;
        for _ in 0..500 {
            let status = limiter.check("h", RateLimitTier::Unlimited).await.unwrap();
            assert_eq!(status.limit, None);
        }
        assert!(store.find_window("h").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let (limiter, clock, _) = limiter().await;
        let fresh = limiter.peek("h", RateLimitTier::Premium).await.unwrap();
        assert_eq!(fresh.remaining, Some(5_000));
        assert_eq!(fresh.resets_at, None);

        limiter.check("h", RateLimitTier::Premium).await.unwrap();
        let after = limiter.peek("h", RateLimitTier::Premium).await.unwrap();
        assert_eq!(after.request_count, 1);
        assert_eq!(
            limiter.peek("h", RateLimitTier::Premium).await.unwrap(),
            after
        );

        clock.advance(Duration::hours(2));
        let expired = limiter.peek("h", RateLimitTier::Premium).await.unwrap();
        assert_eq!(expired.request_count, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (limiter, clock, _) = limiter().await;
        limiter.check("a", RateLimitTier::Standard).await.unwrap();
        limiter.check("b", RateLimitTier::Basic).await.unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(limiter.purge_expired().await.unwrap(), 1);
    }

    #[test]
    fn test_retry_after_rounding() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        assert_eq!(retry_after_seconds(now, now), 1);
        assert_eq!(retry_after_seconds(now, now + Duration::milliseconds(1_001)), 2);
        assert_eq!(retry_after_seconds(now, now + Duration::seconds(30)), 30);
    }
}
