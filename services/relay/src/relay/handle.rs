//! Relay handle: owns one relay's execution context.
//!
//! Each relay runs a single-threaded tokio runtime on a dedicated OS thread,
//! so a stalled accept or forward loop on one port never blocks another. The
//! handle is the only way in: commands travel through the relay's inbox and
//! completion comes back on a oneshot, never through shared socket state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uniproxy_endpoint::Endpoint;

use super::engine::{RelayCommand, RelayEngine, RelayState, RelayStats, RelayStatsSnapshot};
use crate::error::RelayError;

/// Capacity of a relay's command inbox.
const COMMAND_INBOX_SIZE: usize = 8;

/// Poll interval while waiting for a relay thread to exit.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The relay closed its listener and acknowledged.
    Stopped,
    /// The relay's inbox was already closed.
    AlreadyExited,
    /// No acknowledgement within the timeout.
    TimedOut,
}

/// Sends stop requests to one relay.
#[derive(Debug, Clone)]
pub struct RelayStopper {
    commands: mpsc::Sender<RelayCommand>,
}

impl RelayStopper {
    /// Ask the relay to close its listener and wait for the acknowledgement.
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = tokio::time::timeout(
            timeout,
            self.commands.send(RelayCommand::Stop { done: done_tx }),
        )
        .await;

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return StopOutcome::AlreadyExited,
            Err(_) => return StopOutcome::TimedOut,
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => StopOutcome::Stopped,
            // The relay dropped the acknowledgement while exiting.
            Ok(Err(_)) => StopOutcome::AlreadyExited,
            Err(_) => StopOutcome::TimedOut,
        }
    }
}

/// Handle to a running relay.
pub struct RelayHandle {
    /// Local port the relay was asked to bind.
    local_port: u16,
    /// Address the listener actually bound.
    local_addr: SocketAddr,
    /// Upstream this relay chains through.
    upstream: Endpoint,
    /// Observed lifecycle state.
    state: watch::Receiver<RelayState>,
    /// Relay statistics.
    stats: Arc<RelayStats>,
    /// Relay command inbox.
    commands: mpsc::Sender<RelayCommand>,
    /// Thread hosting the relay runtime.
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Spawn a relay thread and wait until its listener is bound.
    ///
    /// Fails with [`RelayError::Bind`] if the port is unavailable; the thread
    /// has exited by the time the error is returned.
    pub async fn spawn(bind_addr: SocketAddr, upstream: Endpoint) -> Result<Self, RelayError> {
        let (state_tx, state_rx) = watch::channel(RelayState::Starting);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_INBOX_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stats = Arc::new(RelayStats::default());

        let engine = RelayEngine::new(bind_addr, upstream.clone(), Arc::clone(&stats), state_tx);

        let thread = thread::Builder::new()
            .name(format!("relay-{}", bind_addr.port()))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RelayError::Runtime(e)));
                        return;
                    }
                };
                runtime.block_on(engine.run(cmd_rx, ready_tx));
            })
            .map_err(RelayError::Spawn)?;

        let local_addr = match ready_rx.await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RelayError::Crashed),
        };

        Ok(Self {
            local_port: if bind_addr.port() == 0 {
                local_addr.port()
            } else {
                bind_addr.port()
            },
            local_addr,
            upstream,
            state: state_rx,
            stats,
            commands: cmd_tx,
            thread: Some(thread),
        })
    }

    /// Local port of this relay.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Upstream endpoint of this relay.
    pub fn upstream(&self) -> &Endpoint {
        &self.upstream
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Current statistics.
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// A cloneable stop channel, usable without holding the handle.
    pub fn stopper(&self) -> RelayStopper {
        RelayStopper {
            commands: self.commands.clone(),
        }
    }

    /// Ask the relay to close its listener and wait for the acknowledgement.
    pub async fn stop(&self, timeout: Duration) -> StopOutcome {
        self.stopper().stop(timeout).await
    }

    /// Terminate the execution context and join its thread.
    ///
    /// Returns `false` if the thread is still alive after `join_timeout`; it
    /// is then detached.
    pub async fn terminate(self, join_timeout: Duration) -> bool {
        let RelayHandle {
            local_port,
            commands,
            thread,
            ..
        } = self;

        let _ = commands.try_send(RelayCommand::Shutdown);
        // Closing the inbox also ends the run loop if the command did not fit.
        drop(commands);

        let Some(thread) = thread else {
            return true;
        };

        let deadline = Instant::now() + join_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }

        if thread.join().is_err() {
            warn!(port = local_port, "Relay thread panicked");
        } else {
            debug!(port = local_port, "Relay thread joined");
        }
        true
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("local_port", &self.local_port)
            .field("local_addr", &self.local_addr)
            .field("upstream", &self.upstream)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn spawn_local() -> RelayHandle {
        RelayHandle::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Endpoint::new("127.0.0.1", 9),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_stop_terminate() {
        let handle = spawn_local().await;
        assert_eq!(handle.state(), RelayState::Listening);
        assert_ne!(handle.local_port(), 0);

        let addr = handle.local_addr();
        TcpStream::connect(addr).await.unwrap();

        assert_eq!(handle.stop(Duration::from_secs(2)).await, StopOutcome::Stopped);
        assert_eq!(handle.state(), RelayState::Stopped);
        assert!(handle.terminate(Duration::from_secs(3)).await);

        // Port released.
        drop(TcpListener::bind(addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawn_on_occupied_port_fails() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let err = RelayHandle::spawn(addr, Endpoint::new("127.0.0.1", 9))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "bind_error");
    }

    #[tokio::test]
    async fn test_stop_after_exit() {
        let handle = spawn_local().await;
        let _ = handle.commands.send(RelayCommand::Shutdown).await;

        // Wait for the thread to finish on its own.
        let deadline = Instant::now() + Duration::from_secs(3);
        while !handle.thread.as_ref().unwrap().is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            handle.stop(Duration::from_millis(200)).await,
            StopOutcome::AlreadyExited
        );
        assert_eq!(handle.state(), RelayState::Stopped);
        assert!(handle.terminate(Duration::from_secs(1)).await);
    }
}
