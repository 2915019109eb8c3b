//! Wire surface toward the host server: response headers and rejection bodies.

pub mod headers;
pub mod rejection;

pub use rejection::{Rejection, RejectionBody};
