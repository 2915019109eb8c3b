//! Presented-credential extraction.

use crate::policy::request::RequestContext;
use crate::KeywardenError;
use reqwest::header::AUTHORIZATION;

/// Pull the raw API key out of a request.
///
/// The designated header wins. Otherwise an `Authorization: Bearer` token
/// is accepted, unless it looks like a JWT (contains `.`), which belongs
/// to the user-session flow rather than key authentication.
///
/// # Errors
/// - `MissingKey` - no usable credential is present
pub fn extract_api_key<'a>(
    ctx: &'a RequestContext,
    api_key_header: &str,
) -> Result<&'a str, KeywardenError> {
    if let Some(key) = ctx.header(api_key_header) {
        return Ok(key);
    }

    ctx.header(AUTHORIZATION.as_str())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty() && !token.contains('.'))
        .ok_or(KeywardenError::MissingKey)
}
