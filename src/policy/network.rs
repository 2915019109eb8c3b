//! IP, CIDR, and domain matching primitives.

use crate::KeywardenError;
use std::net::{IpAddr, Ipv4Addr};

/// Network mask for an IPv4 prefix length. `/0` yields an all-zero mask.
pub fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        return 0;
    }
    u32::MAX << (32 - u32::from(prefix.min(32)))
}

/// Parse `a.b.c.d/n` into network and prefix length.
pub fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (network, prefix) = cidr.trim().split_once('/')?;
    let network = network.trim().parse::<Ipv4Addr>().ok()?;
    let prefix = prefix.trim().parse::<u8>().ok()?;
    (prefix <= 32).then_some((network, prefix))
}

/// Whether `ip` lies inside the IPv4 range `cidr`. Malformed ranges never match.
pub fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    match parse_cidr(cidr) {
        Some((network, prefix)) => {
            let mask = prefix_mask(prefix);
            (u32::from(ip) & mask) == (u32::from(network) & mask)
        }
        None => false,
    }
}

/// Whether a client IP matches one allow-list entry.
///
/// Entries without `/` match by exact string or equal canonical address.
/// Entries with `/` are IPv4 ranges.
pub fn ip_matches(entry: &str, ip: &str) -> bool {
    let entry = entry.trim();
    let ip = ip.trim();
    if entry.is_empty() || ip.is_empty() {
        return false;
    }
    if entry == ip {
        return true;
    }

    let client = match ip.parse::<IpAddr>() {
        Ok(addr) => addr.to_canonical(),
        Err(_) => return false,
    };

    if entry.contains('/') {
        return match client {
            IpAddr::V4(v4) => cidr_contains(entry, v4),
            IpAddr::V6(_) => false,
        };
    }

    entry
        .parse::<IpAddr>()
        .map(|allowed| allowed.to_canonical() == client)
        .unwrap_or(false)
}

/// Lowercase a host and drop a trailing root dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `domain` equals `rule` or is a subdomain of it.
///
/// Suffix matches respect label boundaries, so `example.com` admits
/// `api.example.com` but never `evilexample.com`. A leading `*.` on the
/// rule is accepted as the same suffix wildcard.
pub fn domain_matches(rule: &str, domain: &str) -> bool {
    let rule = normalize_domain(rule);
    let rule = rule.strip_prefix("*.").unwrap_or(&rule);
    let domain = normalize_domain(domain);
    if rule.is_empty() || domain.is_empty() {
        return false;
    }

    domain == rule
        || domain
            .strip_suffix(rule)
            .is_some_and(|head| head.ends_with('.') && head.len() > 1)
}

/// Validate and normalize an IP allow-list entry.
pub fn validate_ip_entry(entry: &str) -> Result<String, KeywardenError> {
    let trimmed = entry.trim();
    let valid = if trimmed.contains('/') {
        parse_cidr(trimmed).is_some()
    } else {
        trimmed.parse::<IpAddr>().is_ok()
    };

    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(KeywardenError::InvalidAllowListEntry(entry.to_string()))
    }
}

/// Validate and normalize a domain allow-list entry (`host` or `*.host`).
pub fn validate_domain_entry(entry: &str) -> Result<String, KeywardenError> {
    let normalized = normalize_domain(entry);
    let host = normalized.strip_prefix("*.").unwrap_or(&normalized);

    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(normalized)
    } else {
        Err(KeywardenError::InvalidAllowListEntry(entry.to_string()))
    }
}
