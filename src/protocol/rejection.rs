//! JSON rejection bodies and the status/headers that go with them.

use crate::protocol::headers::insert_retry_after;
use crate::KeywardenError;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{json, Value};

/// `{ "error": CODE, "message": ..., "details": {...}? }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionBody {
    /// Stable error code, e.g. `RATE_LIMIT_EXCEEDED`.
    pub error: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Structured context for the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&KeywardenError> for RejectionBody {
    fn from(err: &KeywardenError) -> Self {
        // Internal faults are not described to callers
        let message = if err.http_status() >= 500 {
            "Internal error".to_string()
        } else {
            err.to_string()
        };

        Self {
            error: err.code(),
            message,
            details: details(err),
        }
    }
}

fn details(err: &KeywardenError) -> Option<Value> {
    match err {
        KeywardenError::ScopeNotGranted { scope } => Some(json!({ "scope": scope })),
        KeywardenError::DomainNotAllowed { domain, allowed } => {
            Some(json!({ "domain": domain, "allowed": allowed }))
        }
        KeywardenError::IpNotAllowed { ip, allowed } => {
            Some(json!({ "ip": ip, "allowed": allowed }))
        }
        KeywardenError::RateLimitExceeded {
            limit,
            retry_after_seconds,
        } => Some(json!({ "limit": limit, "retry_after_seconds": retry_after_seconds })),
        KeywardenError::QuotaExceeded { limit, used } => {
            Some(json!({ "limit": limit, "used": used }))
        }
        KeywardenError::GraceExceeded { grace_limit, used } => {
            Some(json!({ "grace_limit": grace_limit, "used": used }))
        }
        _ => None,
    }
}

/// Everything a host needs to answer a rejected request.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// HTTP status code.
    pub status: u16,
    /// Extra response headers (`Retry-After` on rate limiting).
    pub headers: HeaderMap,
    /// JSON body.
    pub body: RejectionBody,
}

impl From<&KeywardenError> for Rejection {
    fn from(err: &KeywardenError) -> Self {
        let mut headers = HeaderMap::new();
        if let KeywardenError::RateLimitExceeded {
            retry_after_seconds,
            ..
        } = err
        {
            insert_retry_after(&mut headers, *retry_after_seconds);
        }

        Self {
            status: err.http_status(),
            headers,
            body: RejectionBody::from(err),
        }
    }
}
