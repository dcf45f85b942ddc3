//! The upstream endpoint value type.

use std::fmt;
use std::str::FromStr;

use crate::error::FormatError;

/// Separator between endpoint fields.
pub const FIELD_SEPARATOR: char = ':';

/// An upstream SOCKS5 proxy.
///
/// Immutable once resolved. Relays receive their own clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IPv4 address of the upstream proxy.
    pub host: String,
    /// Port of the upstream proxy.
    pub port: u16,
    /// Optional username for RFC 1929 authentication.
    pub username: Option<String>,
    /// Optional password for RFC 1929 authentication.
    pub password: Option<String>,
}

impl Endpoint {
    /// Creates an endpoint without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Returns a copy of this endpoint with credentials attached.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parses an endpoint from `host:port` or `host:port:username:password`.
    ///
    /// Surrounding whitespace is ignored.
    pub fn parse(s: &str) -> Result<Self, FormatError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FormatError::Empty);
        }

        let fields: Vec<&str> = s.split(FIELD_SEPARATOR).collect();
        let (host, port, credentials) = match fields.as_slice() {
            [host, port] => (*host, *port, None),
            [host, port, username, password] => (*host, *port, Some((*username, *password))),
            other => {
                return Err(FormatError::FieldCount { count: other.len() });
            }
        };

        if host.is_empty() {
            return Err(FormatError::EmptyHost);
        }

        let port = match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => {
                return Err(FormatError::InvalidPort {
                    value: port.to_string(),
                })
            }
        };

        let endpoint = Self::new(host, port);
        Ok(match credentials {
            Some((username, password)) => endpoint.with_credentials(username, password),
            None => endpoint,
        })
    }

    /// Returns the credential pair to offer the upstream, if any.
    ///
    /// Both values must be non-empty; an empty username means the upstream is
    /// approached with the no-authentication method.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Returns `host:port` suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FromStr for Endpoint {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Tests
// =============================================================================
