//! Keywarden configuration.

use crate::model::usage::grace_limit_for;
use crate::KeywardenError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default header carrying the raw API key.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Default header carrying an explicit caller domain.
pub const DEFAULT_DOMAIN_HEADER: &str = "X-Client-Domain";

/// Proxy headers consulted for the client IP, highest priority first.
pub const DEFAULT_CLIENT_IP_HEADERS: &[&str] = &[
    "X-Forwarded-For",
    "X-Real-IP",
    "CF-Connecting-IP",
    "True-Client-IP",
    "X-Client-IP",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
];

/// Configuration for gatekeeping and quota maintenance.
///
/// Every field has a default, so a JSON document only needs to name the
/// settings it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeywardenConfig {
    /// Namespace for on-disk state under the platform data directory.
    pub namespace: String,

    /// Explicit SQLite database path. Overrides `namespace` placement.
    pub database_path: Option<PathBuf>,

    /// Header carrying the raw API key.
    pub api_key_header: String,

    /// Header carrying an explicit caller domain (checked before Origin/Referer).
    pub domain_header: String,

    /// Proxy headers consulted for the client IP, in priority order.
    pub client_ip_headers: Vec<String>,

    /// Prefix prepended to generated raw keys (e.g. "kw_live_").
    pub key_prefix: String,

    /// Monthly quota for keys with no earlier usage row. `-1` means unlimited.
    pub default_monthly_quota: i64,

    /// Percentage above the quota admitted before hard rejection.
    pub grace_percent: u32,

    /// Usage percentage at which a quota warning notification fires.
    pub quota_warning_percent: u32,

    /// Monthly usage rows processed per reset batch.
    pub reset_batch_size: u32,

    /// Whether the reset scheduler runs once immediately on spawn.
    pub run_reset_on_startup: bool,

    /// Months of monthly usage history kept by maintenance.
    pub usage_retention_months: u32,
}

impl Default for KeywardenConfig {
    fn default() -> Self {
        Self {
            namespace: "keywarden".to_string(),
            database_path: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            domain_header: DEFAULT_DOMAIN_HEADER.to_string(),
            client_ip_headers: DEFAULT_CLIENT_IP_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            key_prefix: "kw_".to_string(),
            default_monthly_quota: 1_000,
            grace_percent: 10,
            quota_warning_percent: 80,
            reset_batch_size: 500,
            run_reset_on_startup: true,
            usage_retention_months: 12,
        }
    }
}

impl KeywardenConfig {
    /// Parse configuration from a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, KeywardenError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KeywardenError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self, KeywardenError> {
        let json = fs::read_to_string(path).map_err(|e| {
            KeywardenError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), KeywardenError> {
        if self.namespace.is_empty() {
            return Err(KeywardenError::ConfigError(
                "namespace cannot be empty".to_string(),
            ));
        }
        if self.api_key_header.trim().is_empty() {
            return Err(KeywardenError::ConfigError(
                "api_key_header cannot be empty".to_string(),
            ));
        }
        if self.domain_header.trim().is_empty() {
            return Err(KeywardenError::ConfigError(
                "domain_header cannot be empty".to_string(),
            ));
        }
        if self.client_ip_headers.iter().any(|h| h.trim().is_empty()) {
            return Err(KeywardenError::ConfigError(
                "client_ip_headers cannot contain empty names".to_string(),
            ));
        }
        if self.default_monthly_quota < -1 {
            return Err(KeywardenError::ConfigError(format!(
                "default_monthly_quota must be -1 (unlimited) or non-negative, got {}",
                self.default_monthly_quota
            )));
        }
        if self.grace_percent > 100 {
            return Err(KeywardenError::ConfigError(format!(
                "grace_percent must be at most 100, got {}",
                self.grace_percent
            )));
        }
        if grace_limit_for(self.default_monthly_quota, self.grace_percent).is_none() {
            return Err(KeywardenError::ConfigError(format!(
                "default_monthly_quota {} overflows its grace limit",
                self.default_monthly_quota
            )));
        }
        if self.quota_warning_percent == 0 || self.quota_warning_percent > 100 {
            return Err(KeywardenError::ConfigError(format!(
                "quota_warning_percent must be within 1..=100, got {}",
                self.quota_warning_percent
            )));
        }
        if self.reset_batch_size == 0 {
            return Err(KeywardenError::ConfigError(
                "reset_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the SQLite database path.
    ///
    /// Uses `database_path` when set, otherwise
    /// `dirs::data_dir()/<namespace>/keywarden.db`.
    pub fn resolve_database_path(&self) -> Result<PathBuf, KeywardenError> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let base_dir = dirs::data_dir().ok_or_else(|| {
            KeywardenError::ConfigError("Could not find data directory".to_string())
        })?;
        Ok(base_dir.join(&self.namespace).join("keywarden.db"))
    }
}
