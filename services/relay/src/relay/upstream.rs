//! Upstream leg: this relay acting as a SOCKS5 client.
//!
//! Username/password sub-negotiation (RFC 1929) is used when the endpoint
//! carries non-empty credentials, otherwise the no-authentication method.

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use uniproxy_endpoint::Endpoint;

use super::socks5::TargetAddr;
use crate::error::RelayError;

/// Open a tunnel to `target` through the upstream proxy.
///
/// Returns the raw TCP stream once the upstream has accepted the CONNECT; from
/// then on the stream carries application bytes only.
pub async fn connect_through(
    upstream: &Endpoint,
    target: &TargetAddr,
) -> Result<TcpStream, RelayError> {
    let proxy = (upstream.host.as_str(), upstream.port);
    let target_host = target.host();
    let destination = (target_host.as_str(), target.port());

    let stream = match upstream.credentials() {
        Some((username, password)) => {
            debug!(upstream = %upstream, target = %target, "Connecting upstream with credentials");
            Socks5Stream::connect_with_password(proxy, destination, username, password).await?
        }
        None => {
            debug!(upstream = %upstream, target = %target, "Connecting upstream");
            Socks5Stream::connect(proxy, destination).await?
        }
    };

    Ok(stream.into_inner())
}
