//! Per-key network restriction enforcement.
//!
//! A key may restrict callers by domain (registered domain plus an
//! allow-list with suffix matching) and by client IP (exact addresses and
//! IPv4 CIDR ranges). The domain decides the request when one can be
//! determined and the key has domain rules; otherwise the client IP is
//! checked. An empty allow-list admits everything for its dimension.

use crate::config::KeywardenConfig;
use crate::model::ApiKeyRecord;
use crate::policy::network::{domain_matches, ip_matches, normalize_domain};
use crate::policy::request::{extract_client_ip, extract_domain, RequestContext};
use crate::KeywardenError;
use serde::Serialize;
use tracing::{debug, warn};

/// Which rule admitted a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchInfo {
    /// Admitted by a domain rule.
    Domain {
        /// Calling domain.
        domain: String,
        /// Matching rule (registered domain or allow-list entry).
        rule: String,
    },
    /// Admitted by an IP rule.
    Ip {
        /// Client IP.
        ip: String,
        /// Matching allow-list entry.
        rule: String,
    },
    /// The key has no restriction for the checked dimension.
    Unrestricted,
}

/// Validates a request's origin against a key's network restrictions.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    domain_header: String,
    client_ip_headers: Vec<String>,
}

impl AccessGuard {
    /// Create a guard reading the headers named in the configuration.
    pub fn new(config: &KeywardenConfig) -> Self {
        Self {
            domain_header: config.domain_header.clone(),
            client_ip_headers: config.client_ip_headers.clone(),
        }
    }

    /// Check the request against the key's domain or IP restrictions.
    ///
    /// # Errors
    /// - `DomainNotAllowed` - the calling domain matches no domain rule
    /// - `IpNotAllowed` - the client IP matches no IP rule (or is unknown)
    pub fn validate(
        &self,
        key: &ApiKeyRecord,
        ctx: &RequestContext,
    ) -> Result<MatchInfo, KeywardenError> {
        if key.has_domain_rules() {
            if let Some(domain) = extract_domain(ctx, &self.domain_header) {
                return check_domain(key, &domain);
            }
        }

        if key.allowed_ips.is_empty() {
            return Ok(MatchInfo::Unrestricted);
        }

        let ip = extract_client_ip(ctx, &self.client_ip_headers);
        check_ip(key, ip)
    }
}

fn check_domain(key: &ApiKeyRecord, domain: &str) -> Result<MatchInfo, KeywardenError> {
    let registered = key
        .registered_domain
        .as_deref()
        .filter(|registered| normalize_domain(registered) == normalize_domain(domain));

    let rule = registered.or_else(|| {
        key.allowed_domains
            .iter()
            .map(String::as_str)
            .find(|rule| domain_matches(rule, domain))
    });

    match rule {
        Some(rule) => {
            debug!(key_id = %key.id, domain, rule, "Domain allowed");
            Ok(MatchInfo::Domain {
                domain: domain.to_string(),
                rule: rule.to_string(),
            })
        }
        None => {
            warn!(key_id = %key.id, domain, "Domain not allowed");
            Err(KeywardenError::DomainNotAllowed {
                domain: domain.to_string(),
                allowed: key.domain_allow_list(),
            })
        }
    }
}

fn check_ip(key: &ApiKeyRecord, ip: Option<String>) -> Result<MatchInfo, KeywardenError> {
    let Some(ip) = ip else {
        warn!(key_id = %key.id, "Client IP unknown for IP-restricted key");
        return Err(KeywardenError::IpNotAllowed {
            ip: "unknown".to_string(),
            allowed: key.allowed_ips.clone(),
        });
    };

    match key.allowed_ips.iter().find(|rule| ip_matches(rule, &ip)) {
        Some(rule) => {
            debug!(key_id = %key.id, ip = %ip, rule = %rule, "IP allowed");
            Ok(MatchInfo::Ip {
                ip,
                rule: rule.clone(),
            })
        }
        None => {
            warn!(key_id = %key.id, ip = %ip, "IP not allowed");
            Err(KeywardenError::IpNotAllowed {
                ip,
                allowed: key.allowed_ips.clone(),
            })
        }
    }
}
