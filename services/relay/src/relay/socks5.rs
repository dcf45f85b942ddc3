//! Client-facing SOCKS5 server messages.
//!
//! Only the no-authentication method and the CONNECT command are offered.
//! Parsing never fails by unwinding: every request yields a [`ParseOutcome`]
//! and the session decides between a reply and a silent drop.
//!
//! Reference: RFC 1928

use std::fmt;
use std::net::Ipv4Addr;

/// SOCKS protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;

/// Maximum bytes read for the greeting and for the request.
pub const MAX_HANDSHAKE_READ: usize = 1024;

/// Method selection reply: version 5, no authentication required.
pub const METHOD_NO_AUTH: [u8; 2] = [SOCKS_VERSION, 0x00];

/// Request succeeded, placeholder bound address `0.0.0.0:0`.
pub const REPLY_SUCCEEDED: [u8; 10] = reply(0x00);

/// Upstream connection refused or failed.
pub const REPLY_CONNECTION_REFUSED: [u8; 10] = reply(0x05);

/// Command not supported.
pub const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = reply(0x07);

/// Address type not supported.
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: [u8; 10] = reply(0x08);

/// Builds a reply with an IPv4 zero address and port.
const fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Destination requested by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 address and port.
    Ipv4(Ipv4Addr, u16),
    /// Domain name and port, resolved by the upstream.
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination host as a string.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Domain(name, _) => name.clone(),
        }
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            TargetAddr::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// A request feature the relay does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// A command other than CONNECT.
    Command(u8),
    /// An address type other than IPv4 or domain name.
    AddressType(u8),
}

impl Unsupported {
    /// The reply sent to the client before closing.
    pub fn reply(&self) -> [u8; 10] {
        match self {
            Unsupported::Command(_) => REPLY_COMMAND_NOT_SUPPORTED,
            Unsupported::AddressType(_) => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
        }
    }
}

/// Result of parsing a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Well-formed CONNECT.
    Connect(TargetAddr),
    /// Malformed or truncated request; dropped without a reply.
    Violation(&'static str),
    /// Recognized but unsupported request; answered with an error reply.
    Unsupported(Unsupported),
}

/// Checks the method-selection greeting.
///
/// The offered methods are not inspected: the relay always answers with
/// [`METHOD_NO_AUTH`].
pub fn check_greeting(buf: &[u8]) -> Result<(), &'static str> {
    if buf.len() < 3 {
        return Err("greeting shorter than 3 bytes");
    }
    if buf[0] != SOCKS_VERSION {
        return Err("greeting is not SOCKS version 5");
    }
    Ok(())
}

/// Parses a request: `VER CMD RSV ATYP DST.ADDR DST.PORT`.
pub fn parse_request(buf: &[u8]) -> ParseOutcome {
    if buf.len() < 4 {
        return ParseOutcome::Violation("request shorter than 4 bytes");
    }
    if buf[0] != SOCKS_VERSION {
        return ParseOutcome::Violation("request is not SOCKS version 5");
    }
    if buf[1] != CMD_CONNECT {
        return ParseOutcome::Unsupported(Unsupported::Command(buf[1]));
    }

    match buf[3] {
        ATYP_IPV4 => {
            if buf.len() < 10 {
                return ParseOutcome::Violation("truncated IPv4 request");
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            ParseOutcome::Connect(TargetAddr::Ipv4(ip, port))
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return ParseOutcome::Violation("missing domain length");
            }
            let len = buf[4] as usize;
            let end = 5 + len;
            if buf.len() < end + 2 {
                return ParseOutcome::Violation("truncated domain request");
            }
            let Ok(name) = std::str::from_utf8(&buf[5..end]) else {
                return ParseOutcome::Violation("domain is not valid UTF-8");
            };
            let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
            ParseOutcome::Connect(TargetAddr::Domain(name.to_string(), port))
        }
        other => ParseOutcome::Unsupported(Unsupported::AddressType(other)),
    }
}
