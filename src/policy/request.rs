//! Inbound request context and caller identification.

use reqwest::header::HeaderMap;
use std::net::IpAddr;
use url::Url;

/// What the gatekeeper sees of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Request headers.
    pub headers: HeaderMap,
    /// Transport-level peer address, if the host server knows it.
    pub peer_addr: Option<IpAddr>,
}

impl RequestContext {
    /// Build a context from headers and peer address.
    pub fn new(headers: HeaderMap, peer_addr: Option<IpAddr>) -> Self {
        Self { headers, peer_addr }
    }

    /// A header value as trimmed UTF-8, if present and non-empty.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Determine the calling domain.
///
/// Tries the explicit domain header, then `Origin`, then `Referer`, and
/// reduces the first usable value to a bare lowercase host.
pub fn extract_domain(ctx: &RequestContext, domain_header: &str) -> Option<String> {
    [domain_header, "Origin", "Referer"]
        .into_iter()
        .filter_map(|name| ctx.header(name))
        .find_map(host_of)
}

/// Reduce a header value to a bare lowercase host.
///
/// Accepts full URLs as well as bare hosts with optional port and path.
/// `Origin: null` and unparseable values yield `None`.
pub fn host_of(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        return None;
    }

    let parsed = if value.contains("://") {
        Url::parse(value)
    } else {
        Url::parse(&format!("http://{}", value))
    }
    .ok()?;

    let host = parsed
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    (!host.is_empty()).then_some(host)
}

/// Determine the client IP.
///
/// Walks the proxy headers in priority order and takes the first value
/// that is not `unknown`; for comma chains the first hop is the client.
/// Falls back to the transport peer address.
pub fn extract_client_ip(ctx: &RequestContext, proxy_headers: &[String]) -> Option<String> {
    proxy_headers
        .iter()
        .filter_map(|name| ctx.header(name))
        .filter_map(|value| value.split(',').next().map(str::trim))
        .find(|candidate| !candidate.is_empty() && !candidate.eq_ignore_ascii_case("unknown"))
        .map(String::from)
        .or_else(|| ctx.peer_addr.map(|addr| addr.to_string()))
}
