//! Error types for the relay service.
//!
//! Every error exposes a stable snake_case reason code so callers can classify
//! failures without matching on message text.

use std::io;

use thiserror::Error;
use uniproxy_endpoint::FormatError;

// =============================================================================
// Resolution
// =============================================================================

/// Errors produced while turning user input or an API response into endpoints.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Neither direct input nor an API link was provided.
    #[error("no proxy input or API link provided")]
    MissingInput,

    /// Direct input did not match the endpoint grammar.
    #[error("invalid proxy input: {0}")]
    Format(#[from] FormatError),

    /// A text response contained no parseable endpoint line.
    #[error("no valid proxy entries found in API text response")]
    NoEndpoints,

    /// The API request failed at the network level (connect, timeout, body read).
    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a non-success HTTP status.
    #[error("API returned HTTP {status}")]
    HttpStatus { status: u16 },

    /// The API body looked like JSON but did not parse.
    #[error("API returned malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The API payload was well-formed but logically invalid.
    #[error("API returned an error: {0}")]
    Semantic(String),
}

impl ResolveError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ResolveError::MissingInput => "missing_input",
            ResolveError::Format(_) | ResolveError::NoEndpoints => "format_error",
            ResolveError::Transport(_) | ResolveError::HttpStatus { .. } => "api_transport_error",
            ResolveError::Json(_) | ResolveError::Semantic(_) => "api_semantic_error",
        }
    }
}

// =============================================================================
// Relay
// =============================================================================

/// Errors raised by a single-port relay or one of its sessions.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The local port could not be bound.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The relay thread could not be spawned.
    #[error("failed to spawn relay thread: {0}")]
    Spawn(io::Error),

    /// The relay's runtime could not be built.
    #[error("failed to build relay runtime: {0}")]
    Runtime(io::Error),

    /// The relay thread exited before reporting its bind result.
    #[error("relay thread exited before it started listening")]
    Crashed,

    /// The client broke the SOCKS5 protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The upstream proxy was unreachable or refused the request.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[from] tokio_socks::Error),

    /// Socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_error",
            RelayError::Spawn(_) | RelayError::Runtime(_) | RelayError::Crashed => {
                "relay_start_error"
            }
            RelayError::Protocol(_) => "protocol_violation",
            RelayError::UpstreamConnect(_) => "upstream_connect_error",
            RelayError::Io(_) => "io_error",
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Errors reported by the relay supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Every start attempt for the port failed.
    #[error("failed to start relay on port {port} after {attempts} attempt(s): {last}")]
    StartFailed {
        port: u16,
        attempts: u32,
        #[source]
        last: RelayError,
    },
}

impl SupervisorError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SupervisorError::StartFailed { .. } => "start_failed",
        }
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Errors that fail a whole batch request before any relay is started.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Neither direct input nor an API link was provided.
    #[error("no proxy input or API link provided")]
    MissingInput,

    /// The direct proxy input is malformed.
    #[error("invalid proxy input: {0}")]
    InvalidProxy(#[from] FormatError),

    /// The requested port range does not fit in 1..=65535.
    #[error("port range starting at {start_port} with {count} port(s) exceeds 1-65535")]
    PortRange { start_port: u16, count: usize },
}

impl BatchError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BatchError::MissingInput => "missing_input",
            BatchError::InvalidProxy(_) => "format_error",
            BatchError::PortRange { .. } => "port_range",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_reason_codes() {
        assert_eq!(ResolveError::NoEndpoints.reason_code(), "format_error");
        assert_eq!(
            ResolveError::Format(FormatError::Empty).reason_code(),
            "format_error"
        );
        assert_eq!(
            ResolveError::HttpStatus { status: 502 }.reason_code(),
            "api_transport_error"
        );
        assert_eq!(
            ResolveError::Semantic("quota exceeded".into()).reason_code(),
            "api_semantic_error"
        );
    }

    #[test]
    fn test_start_failed_display() {
        let err = SupervisorError::StartFailed {
            port: 20000,
            attempts: 3,
            last: RelayError::Bind {
                port: 20000,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("port 20000"));
        assert!(msg.contains("3 attempt(s)"));
        assert_eq!(err.reason_code(), "start_failed");
    }

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::PortRange {
            start_port: 65535,
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "port range starting at 65535 with 2 port(s) exceeds 1-65535"
        );
    }
}
