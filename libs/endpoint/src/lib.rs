//! # uniproxy-endpoint
//!
//! The upstream endpoint type shared by the resolver and the relays.
//!
//! ## Endpoint Format
//!
//! Endpoints are written as colon-separated tokens:
//!
//! - `host:port`
//! - `host:port:username:password`
//!
//! Examples:
//! - `proxy.example.net:1080`
//! - `10.0.0.5:7777:alice:s3cret`
//!
//! Any other token count is rejected. IPv6 literals are not supported by this
//! grammar since they contain the separator.

mod endpoint;
mod error;

pub use endpoint::Endpoint;
pub use error::FormatError;
