//! Raw API key generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

/// Random bytes behind every generated key.
pub const KEY_ENTROPY_BYTES: usize = 32;

/// Characters of the raw key kept for display.
pub const DISPLAY_PREFIX_LEN: usize = 12;

/// Generate a fresh raw key: `<prefix>` followed by base64url of 32 random bytes.
///
/// The output never contains `.`, so it cannot be mistaken for a JWT
/// when presented as a bearer token.
pub fn generate_api_key(prefix: &str) -> String {
    let mut bytes = [0u8; KEY_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

/// Leading characters of a raw key, safe to show in dashboards.
pub fn display_prefix(raw_key: &str) -> String {
    raw_key.chars().take(DISPLAY_PREFIX_LEN).collect()
}
