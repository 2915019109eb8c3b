//! Outbound rate-limit and quota headers.

use crate::meter::RateLimitStatus;
use crate::model::QuotaStatus;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};

/// Request ceiling of the rate-limit window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the rate-limit window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Window close, epoch seconds.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// Monthly quota, or `unlimited`.
pub const X_QUOTA_LIMIT: HeaderName = HeaderName::from_static("x-quota-limit");
/// Calls left before the monthly quota.
pub const X_QUOTA_REMAINING: HeaderName = HeaderName::from_static("x-quota-remaining");
/// Next monthly reset, epoch seconds.
pub const X_QUOTA_RESET: HeaderName = HeaderName::from_static("x-quota-reset");
/// `add-on` or `grace` when the call was admitted over quota.
pub const X_QUOTA_OVERAGE: HeaderName = HeaderName::from_static("x-quota-overage");

/// Write `X-RateLimit-*`. Unlimited tiers get no headers.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    let (Some(limit), Some(remaining)) = (status.limit, status.remaining) else {
        return;
    };
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    if let Some(resets_at) = status.resets_at {
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(resets_at.timestamp()));
    }
}

/// Write `X-Quota-*`, plus `X-Quota-Overage` when `overage` is set.
pub fn insert_quota_headers(headers: &mut HeaderMap, status: &QuotaStatus, overage: Option<&'static str>) {
    match status.remaining {
        Some(remaining) => {
            headers.insert(X_QUOTA_LIMIT, HeaderValue::from(status.quota_limit));
            headers.insert(X_QUOTA_REMAINING, HeaderValue::from(remaining));
        }
        None => {
            headers.insert(X_QUOTA_LIMIT, HeaderValue::from_static("unlimited"));
        }
    }
    headers.insert(X_QUOTA_RESET, HeaderValue::from(status.resets_at.timestamp()));
    if let Some(overage) = overage {
        headers.insert(X_QUOTA_OVERAGE, HeaderValue::from_static(overage));
    }
}

/// Write `Retry-After` in whole seconds.
pub fn insert_retry_after(headers: &mut HeaderMap, seconds: i64) {
    headers.insert(RETRY_AFTER, HeaderValue::from(seconds.max(1)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RateLimitTier;
    use crate::model::UNLIMITED;
    use chrono::{TimeZone, Utc};

    fn value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
        headers.get(name).unwrap().to_str().unwrap()
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        let status = RateLimitStatus {
            tier: RateLimitTier::Standard,
            limit: Some(1_000),
            remaining: Some(998),
            request_count: 2,
            resets_at: Some(Utc.with_ymd_and_hms(2025, 1, 15, 13, 0, 0).unwrap()),
        };
        insert_rate_limit_headers(&mut headers, &status);

        assert_eq!(value(&headers, "X-RateLimit-Limit"), "1000");
        assert_eq!(value(&headers, "X-RateLimit-Remaining"), "998");
        assert_eq!(value(&headers, "X-RateLimit-Reset"), "1736946000");
    }

    #[test]
    fn test_unlimited_tier_has_no_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        let status = RateLimitStatus {
            tier: RateLimitTier::Unlimited,
            limit: None,
            remaining: None,
            request_count: 0,
            resets_at: None,
        };
        insert_rate_limit_headers(&mut headers, &status);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_quota_headers_with_overage() {
        let resets_at = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let status = QuotaStatus::compute("2025-01".to_string(), 100, 110, 104, resets_at);
        let mut headers = HeaderMap::new();
        insert_quota_headers(&mut headers, &status, Some("grace"));

        assert_eq!(value(&headers, "X-Quota-Limit"), "100");
        assert_eq!(value(&headers, "X-Quota-Remaining"), "0");
        assert_eq!(value(&headers, "X-Quota-Reset"), "1738368000");
        assert_eq!(value(&headers, "X-Quota-Overage"), "grace");
    }

    #[test]
    fn test_unlimited_quota_headers() {
        let resets_at = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let status = QuotaStatus::compute("2025-01".to_string(), UNLIMITED, UNLIMITED, 5, resets_at);
        let mut headers = HeaderMap::new();
        insert_quota_headers(&mut headers, &status, None);

        assert_eq!(value(&headers, "X-Quota-Limit"), "unlimited");
        assert!(headers.get("X-Quota-Remaining").is_none());
        assert!(headers.get("X-Quota-Overage").is_none());
    }

    #[test]
    fn test_retry_after_is_at_least_one() {
        let mut headers = HeaderMap::new();
        insert_retry_after(&mut headers, 0);
        assert_eq!(value(&headers, "Retry-After"), "1");
    }
}
