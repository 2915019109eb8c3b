//! Keywarden error types.

use thiserror::Error;

/// Errors raised while gatekeeping a request or running quota maintenance.
#[derive(Debug, Error)]
pub enum KeywardenError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No API key was presented with the request.
    #[error("No API key provided")]
    MissingKey,

    /// The presented key does not match any issued key.
    #[error("Invalid API key")]
    InvalidKey,

    /// The key exists but has been deactivated.
    #[error("API key is inactive")]
    InactiveKey,

    /// The key is past its expiry time.
    #[error("API key has expired")]
    ExpiredKey,

    /// The key has been revoked.
    #[error("API key has been revoked")]
    RevokedKey,

    /// No key with the given id exists (management operations).
    #[error("API key not found: {0}")]
    KeyNotFound(String),

    /// The key does not carry the scope the operation requires.
    #[error("API key lacks required scope: {scope}")]
    ScopeNotGranted {
        /// The scope that was required.
        scope: String,
    },

    /// The calling domain is not on the key's allow-list.
    #[error("Domain not allowed: {domain}")]
    DomainNotAllowed {
        /// Domain extracted from the request.
        domain: String,
        /// Registered domain and allowed domains configured on the key.
        allowed: Vec<String>,
    },

    /// The client IP is not on the key's allow-list.
    #[error("IP address not allowed: {ip}")]
    IpNotAllowed {
        /// Client IP extracted from the request.
        ip: String,
        /// Allowed IPs and CIDR ranges configured on the key.
        allowed: Vec<String>,
    },

    /// Too many requests in the current rate-limit window.
    #[error("Rate limit exceeded ({limit} requests per window), retry in {retry_after_seconds}s")]
    RateLimitExceeded {
        /// Request ceiling of the key's tier.
        limit: u64,
        /// Seconds until the current window closes.
        retry_after_seconds: i64,
    },

    /// Monthly quota is exhausted and no overage is available.
    #[error("Monthly quota exceeded ({used}/{limit})")]
    QuotaExceeded {
        /// Monthly quota limit.
        limit: i64,
        /// Calls counted this month.
        used: i64,
    },

    /// Monthly quota and the grace band above it are both exhausted.
    #[error("Monthly grace limit exceeded ({used}/{grace_limit})")]
    GraceExceeded {
        /// Grace limit (quota plus grace percentage).
        grace_limit: i64,
        /// Calls counted this month.
        used: i64,
    },

    /// Quota is exhausted and every purchased add-on grant is used up.
    #[error("Add-on capacity depleted")]
    AddOnDepleted,

    /// A rate-limit tier name was not recognized.
    #[error("Unknown rate limit tier: {0}")]
    UnknownTier(String),

    /// A scope name was not recognized.
    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    /// An add-on package name was not recognized.
    #[error("Unknown add-on package: {0}")]
    UnknownPackage(String),

    /// An IP, CIDR, or domain allow-list entry is malformed.
    #[error("Invalid allow-list entry: {0}")]
    InvalidAllowListEntry(String),

    /// Resetting a single monthly usage record failed.
    #[error("Quota reset failed for record {record_id}: {reason}")]
    SchedulerRecordFailed {
        /// Monthly usage row id.
        record_id: String,
        /// Underlying failure.
        reason: String,
    },

    /// A quota reset run could not proceed at all.
    #[error("Quota reset run failed: {0}")]
    SchedulerRunFailed(String),

    /// Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Account directory or notification collaborator error.
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl KeywardenError {
    /// Stable machine-readable code used in rejection bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::MissingKey => "MISSING_API_KEY",
            Self::InvalidKey => "INVALID_API_KEY",
            Self::InactiveKey => "INACTIVE_API_KEY",
            Self::ExpiredKey => "EXPIRED_API_KEY",
            Self::RevokedKey => "REVOKED_API_KEY",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::ScopeNotGranted { .. } => "SCOPE_NOT_GRANTED",
            Self::DomainNotAllowed { .. } => "DOMAIN_NOT_ALLOWED",
            Self::IpNotAllowed { .. } => "IP_NOT_ALLOWED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::GraceExceeded { .. } => "GRACE_EXCEEDED",
            Self::AddOnDepleted => "ADD_ON_DEPLETED",
            Self::UnknownTier(_) => "UNKNOWN_TIER",
            Self::UnknownScope(_) => "UNKNOWN_SCOPE",
            Self::UnknownPackage(_) => "UNKNOWN_PACKAGE",
            Self::InvalidAllowListEntry(_) => "INVALID_ALLOW_LIST_ENTRY",
            Self::SchedulerRecordFailed { .. } => "SCHEDULER_RECORD_FAILED",
            Self::SchedulerRunFailed(_) => "SCHEDULER_RUN_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Collaborator(_) => "COLLABORATOR_ERROR",
        }
    }

    /// HTTP status a host server should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingKey
            | Self::InvalidKey
            | Self::InactiveKey
            | Self::ExpiredKey
            | Self::RevokedKey => 401,
            Self::ScopeNotGranted { .. }
            | Self::DomainNotAllowed { .. }
            | Self::IpNotAllowed { .. } => 403,
            Self::RateLimitExceeded { .. }
            | Self::QuotaExceeded { .. }
            | Self::GraceExceeded { .. }
            | Self::AddOnDepleted => 429,
            Self::KeyNotFound(_) => 404,
            Self::UnknownTier(_)
            | Self::UnknownScope(_)
            | Self::UnknownPackage(_)
            | Self::InvalidAllowListEntry(_) => 400,
            Self::Collaborator(_) => 502,
            Self::ConfigError(_)
            | Self::SchedulerRecordFailed { .. }
            | Self::SchedulerRunFailed(_)
            | Self::Storage(_) => 500,
        }
    }

    /// Whether this is a terminal rejection of the caller rather than an internal fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self.http_status(), 401 | 403 | 429)
    }

    /// Whether this rejection comes from monthly quota enforcement.
    pub fn is_quota_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::GraceExceeded { .. } | Self::AddOnDepleted
        )
    }
}
