//! Single-port relay engine: listener, accept loop and per-client sessions.
//!
//! An engine runs inside its own execution context (see [`super::RelayHandle`])
//! and is commanded only through its inbox. It never changes state on its
//! own except `Starting -> Listening` after bind and `Stopping -> Stopped`
//! once the listener is closed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uniproxy_endpoint::Endpoint;

use super::forward::relay_bidirectional;
use super::socks5::{
    self, ParseOutcome, MAX_HANDSHAKE_READ, METHOD_NO_AUTH, REPLY_CONNECTION_REFUSED,
    REPLY_SUCCEEDED,
};
use super::upstream::connect_through;
use crate::error::RelayError;

/// Pause after a failed accept to avoid a tight loop on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Execution context spawned, listener not bound yet.
    Starting,
    /// Listener bound and accepting clients.
    Listening,
    /// Stop requested, listener closing.
    Stopping,
    /// Listener closed and port released.
    Stopped,
}

/// Commands accepted by a relay's inbox.
#[derive(Debug)]
pub enum RelayCommand {
    /// Close the listener and acknowledge on `done`. Sessions keep running.
    Stop { done: oneshot::Sender<()> },
    /// Leave the run loop; remaining sessions are aborted.
    Shutdown,
}

/// Statistics for a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total clients accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished.
    pub connections_closed: AtomicU64,
    /// Sessions dropped for malformed or unsupported requests.
    pub protocol_errors: AtomicU64,
    /// Sessions whose upstream connect or authentication failed.
    pub upstream_failures: AtomicU64,
    /// Bytes forwarded client -> upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes forwarded upstream -> client.
    pub bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub protocol_errors: u64,
    pub upstream_failures: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl RelayStats {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// A SOCKS5-to-SOCKS5 relay for one local port.
pub struct RelayEngine {
    /// Address to bind to.
    bind_addr: SocketAddr,
    /// Upstream every session is chained through.
    upstream: Arc<Endpoint>,
    /// Statistics shared with the handle.
    stats: Arc<RelayStats>,
    /// Published lifecycle state.
    state: watch::Sender<RelayState>,
}

impl RelayEngine {
    /// Create a new engine in the `Starting` state.
    pub fn new(
        bind_addr: SocketAddr,
        upstream: Endpoint,
        stats: Arc<RelayStats>,
        state: watch::Sender<RelayState>,
    ) -> Self {
        state.send_replace(RelayState::Starting);
        Self {
            bind_addr,
            upstream: Arc::new(upstream),
            stats,
            state,
        }
    }

    /// Bind, report the outcome on `ready`, then serve until shut down.
    ///
    /// Returns once a `Shutdown` command arrives or the inbox closes.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<RelayCommand>,
        ready: oneshot::Sender<Result<SocketAddr, RelayError>>,
    ) {
        let port = self.bind_addr.port();

        let bound = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.set_state(RelayState::Stopped);
                let _ = ready.send(Err(RelayError::Bind { port, source }));
                return;
            }
        };

        self.set_state(RelayState::Listening);
        info!(
            local_addr = %local_addr,
            upstream = %self.upstream,
            "Relay listening"
        );

        if ready.send(Ok(local_addr)).is_err() {
            // Nobody is waiting for this relay any more.
            self.set_state(RelayState::Stopped);
            return;
        }

        let mut listener = Some(listener);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(RelayCommand::Stop { done }) => {
                        self.close_listener(&mut listener);
                        let _ = done.send(());
                    }
                    Some(RelayCommand::Shutdown) | None => break,
                },

                accepted = accept_next(listener.as_ref()) => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let upstream = Arc::clone(&self.upstream);
                        let stats = Arc::clone(&self.stats);
                        sessions.spawn(
                            async move {
                                run_session(stream, &upstream, &stats).await;
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            }
                            .instrument(tracing::info_span!("session", port, peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(port, error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        self.close_listener(&mut listener);

        if !sessions.is_empty() {
            debug!(port, remaining = sessions.len(), "Aborting in-flight sessions");
        }
        sessions.shutdown().await;
        debug!(port, "Relay execution context finished");
    }

    /// Close the listener if still open, moving through `Stopping` to `Stopped`.
    fn close_listener(&self, listener: &mut Option<TcpListener>) {
        if let Some(listener) = listener.take() {
            self.set_state(RelayState::Stopping);
            drop(listener);
            self.set_state(RelayState::Stopped);
            info!(port = self.bind_addr.port(), "Relay stopped listening");
        }
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(port = self.bind_addr.port(), from = ?previous, to = ?state, "Relay state changed");
        }
    }
}

/// Accept from the listener, or wait forever once it is closed.
async fn accept_next(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Run one client session and account for how it ended.
async fn run_session(client: TcpStream, upstream: &Endpoint, stats: &RelayStats) {
    match handle_session(client, upstream, stats).await {
        Ok(()) => {}
        Err(e @ RelayError::Protocol(_)) => {
            stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Dropped client");
        }
        Err(e @ RelayError::UpstreamConnect(_)) => {
            stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
            warn!(upstream = %upstream, error = %e, "Upstream connect failed");
        }
        Err(e) => {
            debug!(error = %e, reason = e.reason_code(), "Session error");
        }
    }
}

/// Drive the SOCKS5 exchange with the client, chain through the upstream and
/// forward bytes until either side closes.
async fn handle_session(
    mut client: TcpStream,
    upstream: &Endpoint,
    stats: &RelayStats,
) -> Result<(), RelayError> {
    let mut buf = vec![0u8; MAX_HANDSHAKE_READ];

    let n = client.read(&mut buf).await?;
    socks5::check_greeting(&buf[..n]).map_err(RelayError::Protocol)?;

    client.write_all(&METHOD_NO_AUTH).await?;
    client.flush().await?;

    let n = client.read(&mut buf).await?;
    let target = match socks5::parse_request(&buf[..n]) {
        ParseOutcome::Connect(target) => target,
        ParseOutcome::Violation(reason) => return Err(RelayError::Protocol(reason)),
        ParseOutcome::Unsupported(kind) => {
            client.write_all(&kind.reply()).await?;
            client.flush().await?;
            stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
            debug!(unsupported = ?kind, "Rejected request");
            return Ok(());
        }
    };

    debug!(target = %target, "CONNECT requested");

    let tunnel = match connect_through(upstream, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            // The upstream failure is what gets reported, even if the client is gone.
            if let Err(write_err) = refuse(&mut client).await {
                debug!(error = %write_err, "Client gone before refusal reply");
            }
            return Err(e);
        }
    };

    client.write_all(&REPLY_SUCCEEDED).await?;
    client.flush().await?;
    debug!(target = %target, upstream = %upstream, "Tunnel established");

    let transferred = relay_bidirectional(client, tunnel).await;
    stats
        .bytes_to_upstream
        .fetch_add(transferred.to_upstream, Ordering::Relaxed);
    stats
        .bytes_to_client
        .fetch_add(transferred.to_client, Ordering::Relaxed);

    debug!(
        target = %target,
        bytes_to_upstream = transferred.to_upstream,
        bytes_to_client = transferred.to_client,
        "Session closed"
    );

    Ok(())
}

async fn refuse(client: &mut TcpStream) -> std::io::Result<()> {
    client.write_all(&REPLY_CONNECTION_REFUSED).await?;
    client.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = RelayStats::default();
        stats.connections_accepted.fetch_add(2, Ordering::Relaxed);
        stats.bytes_to_client.fetch_add(512, Ordering::Relaxed);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.bytes_to_client, 512);
        assert_eq!(snapshot.connections_active, 0);
    }

    #[tokio::test]
    async fn test_engine_stop_then_shutdown() {
        let (state_tx, state_rx) = watch::channel(RelayState::Starting);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = oneshot::channel();
        let engine = RelayEngine::new(
            "127.0.0.1:0".parse().unwrap(),
            Endpoint::new("127.0.0.1", 1),
            Arc::new(RelayStats::default()),
            state_tx,
        );

        let task = tokio::spawn(engine.run(cmd_rx, ready_tx));
        let local_addr = ready_rx.await.unwrap().unwrap();
        assert_eq!(*state_rx.borrow(), RelayState::Listening);

        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx.send(RelayCommand::Stop { done: done_tx }).await.unwrap();
        done_rx.await.unwrap();
        assert_eq!(*state_rx.borrow(), RelayState::Stopped);

        // The port is free again once stop is acknowledged.
        let rebound = TcpListener::bind(local_addr).await.unwrap();
        drop(rebound);

        cmd_tx.send(RelayCommand::Shutdown).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_bind_failure_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let (state_tx, state_rx) = watch::channel(RelayState::Starting);
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = oneshot::channel();
        let engine = RelayEngine::new(
            addr,
            Endpoint::new("127.0.0.1", 1),
            Arc::new(RelayStats::default()),
            state_tx,
        );

        engine.run(cmd_rx, ready_tx).await;
        let err = ready_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Bind { port, .. } if port == addr.port()));
        assert_eq!(*state_rx.borrow(), RelayState::Stopped);
    }
}
