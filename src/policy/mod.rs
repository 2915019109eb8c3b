//! Network access policy: request context, matching primitives, and the guard.

pub mod access;
pub mod network;
pub mod request;

pub use access::{AccessGuard, MatchInfo};
pub use request::RequestContext;
