//! Purchased add-on capacity.

use crate::KeywardenError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Add-on package sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddOnPackage {
    /// 1 000 extra requests.
    Starter,
    /// 10 000 extra requests.
    Growth,
    /// 100 000 extra requests.
    Scale,
    /// Negotiated size.
    Custom(i64),
}

impl AddOnPackage {
    /// Extra requests granted by the package.
    pub fn additional_requests(&self) -> i64 {
        match self {
            Self::Starter => 1_000,
            Self::Growth => 10_000,
            Self::Scale => 100_000,
            Self::Custom(n) => *n,
        }
    }

    /// Storage name (the request count is stored separately).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "STARTER",
            Self::Growth => "GROWTH",
            Self::Scale => "SCALE",
            Self::Custom(_) => "CUSTOM",
        }
    }

    /// Rebuild a package from its stored name and request count.
    pub(crate) fn from_stored(name: &str, additional_requests: i64) -> Result<Self, KeywardenError> {
        match name {
            "CUSTOM" => Ok(Self::Custom(additional_requests)),
            other => other.parse(),
        }
    }
}

impl FromStr for AddOnPackage {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTER" => Ok(Self::Starter),
            "GROWTH" => Ok(Self::Growth),
            "SCALE" => Ok(Self::Scale),
            _ => Err(KeywardenError::UnknownPackage(s.to_string())),
        }
    }
}

impl fmt::Display for AddOnPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(n) => write!(f, "CUSTOM({})", n),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Overflow capacity purchased for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOnGrant {
    /// Grant id.
    pub id: String,
    /// Key the capacity applies to.
    pub api_key_id: String,
    /// Owning account.
    pub account_id: String,
    /// Package purchased.
    pub package: AddOnPackage,
    /// Extra requests purchased.
    pub additional_requests: i64,
    /// Requests consumed so far.
    pub requests_used: i64,
    /// Whether the grant may still be consumed.
    pub active: bool,
    /// Start of the validity window.
    pub activated_at: DateTime<Utc>,
    /// End of the validity window (exclusive).
    pub expires_at: DateTime<Utc>,
    /// Whether billing should renew the grant on expiry.
    pub auto_renew: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl AddOnGrant {
    /// Requests still available on the grant.
    pub fn requests_remaining(&self) -> i64 {
        (self.additional_requests - self.requests_used).max(0)
    }

    /// `active ∧ now ∈ [activated_at, expires_at) ∧ remaining > 0`.
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.activated_at <= now
            && now < self.expires_at
            && self.requests_remaining() > 0
    }
}
