//! API key records, rate-limit tiers, and scopes.

use crate::KeywardenError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named rate-limit class with a fixed request ceiling and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitTier {
    /// 100 requests per day.
    Basic,
    /// 1 000 requests per hour.
    Standard,
    /// 5 000 requests per hour.
    Premium,
    /// 20 000 requests per hour.
    Enterprise,
    /// No ceiling.
    Unlimited,
}

impl RateLimitTier {
    /// Request ceiling per window (`None` = unlimited).
    pub fn request_limit(&self) -> Option<u64> {
        match self {
            Self::Basic => Some(100),
            Self::Standard => Some(1_000),
            Self::Premium => Some(5_000),
            Self::Enterprise => Some(20_000),
            Self::Unlimited => None,
        }
    }

    /// Window length in seconds.
    pub fn window_seconds(&self) -> i64 {
        match self {
            Self::Basic | Self::Unlimited => 86_400,
            Self::Standard | Self::Premium | Self::Enterprise => 3_600,
        }
    }

    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "BASIC",
            Self::Standard => "STANDARD",
            Self::Premium => "PREMIUM",
            Self::Enterprise => "ENTERPRISE",
            Self::Unlimited => "UNLIMITED",
        }
    }
}

impl FromStr for RateLimitTier {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BASIC" => Ok(Self::Basic),
            "STANDARD" => Ok(Self::Standard),
            "PREMIUM" => Ok(Self::Premium),
            "ENTERPRISE" => Ok(Self::Enterprise),
            "UNLIMITED" => Ok(Self::Unlimited),
            _ => Err(KeywardenError::UnknownTier(s.to_string())),
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability granted to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiScope {
    /// Read resources.
    Read,
    /// Create or update resources.
    Write,
    /// Delete resources.
    Delete,
    /// Everything, including key management.
    Admin,
}

impl ApiScope {
    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for ApiScope {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "admin" => Ok(Self::Admin),
            _ => Err(KeywardenError::UnknownScope(s.to_string())),
        }
    }
}

impl fmt::Display for ApiScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored identity of an issued API key. The raw secret is never kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Opaque key id.
    pub id: String,

    /// Hex SHA-256 of the raw key.
    #[serde(skip_serializing)]
    pub key_hash: String,

    /// Leading characters of the raw key, for display.
    pub key_prefix: String,

    /// Human-readable label.
    pub name: String,

    /// Owning account.
    pub account_id: String,

    /// Activity flag.
    pub active: bool,

    /// Expiry time, if any.
    pub expires_at: Option<DateTime<Utc>>,

    /// Revocation time, if revoked.
    pub revoked_at: Option<DateTime<Utc>>,

    /// Primary domain the key was registered for.
    pub registered_domain: Option<String>,

    /// Allowed client IPs and IPv4 CIDR ranges (empty = any).
    pub allowed_ips: Vec<String>,

    /// Allowed calling domains (empty = any).
    pub allowed_domains: Vec<String>,

    /// Rate-limit tier.
    pub tier: RateLimitTier,

    /// Granted scopes.
    pub scopes: Vec<ApiScope>,

    /// Issuance time.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,

    /// Last successful authentication (best effort).
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Check whether the key may be used at `now`.
    ///
    /// Conditions are checked in order: inactive, revoked, expired.
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), KeywardenError> {
        if !self.active {
            return Err(KeywardenError::InactiveKey);
        }
        if self.revoked_at.is_some() {
            return Err(KeywardenError::RevokedKey);
        }
        if self.is_expired(now) {
            return Err(KeywardenError::ExpiredKey);
        }
        Ok(())
    }

    /// Whether the key is past its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// `active ∧ ¬expired ∧ not revoked`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.check_usable(now).is_ok()
    }

    /// Whether the key has any domain restriction configured.
    pub fn has_domain_rules(&self) -> bool {
        self.registered_domain.is_some() || !self.allowed_domains.is_empty()
    }

    /// Registered domain followed by allowed domains, for diagnostics.
    pub fn domain_allow_list(&self) -> Vec<String> {
        self.registered_domain
            .iter()
            .chain(self.allowed_domains.iter())
            .cloned()
            .collect()
    }

    /// Fail unless the key carries `scope` (or `admin`).
    pub fn require_scope(&self, scope: ApiScope) -> Result<(), KeywardenError> {
        if self
            .scopes
            .iter()
            .any(|granted| *granted == scope || *granted == ApiScope::Admin)
        {
            Ok(())
        } else {
            Err(KeywardenError::ScopeNotGranted {
                scope: scope.as_str().to_string(),
            })
        }
    }
}
