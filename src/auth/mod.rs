//! Key authentication: credential extraction and the key resolver.

pub mod credentials;
pub mod resolver;

pub use credentials::extract_api_key;
pub use resolver::{IssuedKey, KeyResolver, NewApiKey};
