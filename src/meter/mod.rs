//! Metering: per-window rate limits, monthly quota, and add-on capacity.

pub mod addon;
pub mod quota;
pub mod ratelimit;

pub use addon::AddOnLedger;
pub use quota::{QuotaAccountant, QuotaDecision};
pub use ratelimit::{retry_after_seconds, RateLimitStatus, RateLimiter};
