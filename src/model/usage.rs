//! Monthly usage aggregates and quota arithmetic.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Quota limit value meaning "no monthly ceiling".
pub const UNLIMITED: i64 = -1;

/// Outcome of a metered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The request was served successfully.
    Success,
    /// The request was admitted but failed downstream.
    Failure,
    /// The request was rejected for quota.
    QuotaExceeded,
}

impl CallOutcome {
    /// Per-outcome counter increments `(successful, failed, quota_exceeded)`.
    pub(crate) fn increments(&self) -> (i64, i64, i64) {
        match self {
            Self::Success => (1, 0, 0),
            Self::Failure => (0, 1, 0),
            Self::QuotaExceeded => (0, 0, 1),
        }
    }
}

/// Per-key, per-month call aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    /// Row id.
    pub id: String,
    /// Metered key.
    pub api_key_id: String,
    /// Owning account.
    pub account_id: String,
    /// Month in `YYYY-MM` form.
    pub month_year: String,
    /// All calls, equal to the sum of the three outcome counters.
    pub total_calls: i64,
    /// Calls that succeeded.
    pub successful_calls: i64,
    /// Calls that failed.
    pub failed_calls: i64,
    /// Calls rejected for quota.
    pub quota_exceeded_calls: i64,
    /// Monthly quota (`-1` = unlimited).
    pub quota_limit: i64,
    /// Quota plus grace band (`-1` = unlimited).
    pub grace_limit: i64,
    /// First day of the month in which this row was last reset.
    pub last_reset_date: NaiveDate,
    /// First call of the month.
    pub first_call_at: Option<DateTime<Utc>>,
    /// Most recent call.
    pub last_call_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl MonthlyUsage {
    /// Whether the aggregate is internally consistent.
    pub fn is_consistent(&self) -> bool {
        self.total_calls == self.successful_calls + self.failed_calls + self.quota_exceeded_calls
    }
}

/// Counters returned atomically by a single recording statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Total calls after this increment.
    pub total_calls: i64,
    /// Successful calls after this increment.
    pub successful_calls: i64,
    /// Failed calls after this increment.
    pub failed_calls: i64,
    /// Quota-rejected calls after this increment.
    pub quota_exceeded_calls: i64,
    /// Quota limit on the row.
    pub quota_limit: i64,
    /// Grace limit on the row.
    pub grace_limit: i64,
}

/// Quota position of a key for the current month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    /// Month in `YYYY-MM` form.
    pub month_year: String,
    /// Monthly quota (`-1` = unlimited).
    pub quota_limit: i64,
    /// Grace limit (`-1` = unlimited).
    pub grace_limit: i64,
    /// Calls counted this month.
    pub used: i64,
    /// Calls left before the quota (`None` = unlimited).
    pub remaining: Option<i64>,
    /// `used ≥ quota_limit` for a limited quota.
    pub is_exceeded: bool,
    /// `used ≥ grace_limit` for a limited quota.
    pub is_grace_exceeded: bool,
    /// `used / quota_limit · 100` (0 when unlimited).
    pub usage_percentage: f64,
    /// When the next monthly reset is due.
    pub resets_at: DateTime<Utc>,
}

impl QuotaStatus {
    /// Derive the status from counters and limits.
    pub fn compute(
        month_year: String,
        quota_limit: i64,
        grace_limit: i64,
        used: i64,
        resets_at: DateTime<Utc>,
    ) -> Self {
        let limited = quota_limit != UNLIMITED;
        let remaining = limited.then(|| (quota_limit - used).max(0));
        let usage_percentage = if limited && quota_limit > 0 {
            used as f64 / quota_limit as f64 * 100.0
        } else if limited {
            100.0
        } else {
            0.0
        };

        Self {
            month_year,
            quota_limit,
            grace_limit,
            used,
            remaining,
            is_exceeded: limited && used >= quota_limit,
            is_grace_exceeded: grace_limit != UNLIMITED && used >= grace_limit,
            usage_percentage,
            resets_at,
        }
    }

    /// Whether a grace band exists above the quota.
    pub fn has_grace_band(&self) -> bool {
        self.grace_limit != UNLIMITED && self.grace_limit > self.quota_limit
    }
}

/// `ceil(quota · (1 + grace_percent / 100))`, preserving unlimited.
///
/// `None` when the result does not fit in an `i64`.
pub fn grace_limit_for(quota_limit: i64, grace_percent: u32) -> Option<i64> {
    if quota_limit == UNLIMITED {
        return Some(UNLIMITED);
    }
    let quota = i128::from(quota_limit);
    let grace = (quota * i128::from(grace_percent) + 99) / 100;
    i64::try_from(quota + grace).ok()
}

/// Format a DateTime as YYYY-MM for monthly tracking.
pub fn format_month(dt: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", dt.year(), dt.month())
}

/// First day of the month containing `dt`.
pub fn first_of_month(dt: &DateTime<Utc>) -> NaiveDate {
    let date = dt.date_naive();
    date.with_day(1).unwrap_or(date)
}

/// Midnight UTC on the first day of the month after `dt`.
pub fn first_of_next_month(dt: &DateTime<Utc>) -> DateTime<Utc> {
    let next = first_of_month(dt)
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX);
    next.and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or_default()
}

/// `YYYY-MM` of the month `months` before the month containing `dt`.
pub fn month_before(dt: &DateTime<Utc>, months: u32) -> String {
    let date = first_of_month(dt)
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN);
    format!("{:04}-{:02}", date.year(), date.month())
}
