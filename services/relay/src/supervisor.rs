//! Relay supervisor.
//!
//! Owns the port -> relay table. At most one relay exists per local port:
//! starting on an occupied port first tears the previous relay down and waits
//! for its socket to be released. Operations on the same port are serialized;
//! different ports proceed independently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uniproxy_endpoint::Endpoint;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::relay::{RelayHandle, RelayState, RelayStatsSnapshot, StopOutcome};

/// Supervises one relay per local port.
pub struct RelaySupervisor {
    /// Supervisor configuration.
    config: SupervisorConfig,
    /// Active relays by local port.
    relays: Mutex<HashMap<u16, RelayHandle>>,
    /// Per-port operation locks. `stop_on_port` prunes entries no operation holds.
    port_locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl RelaySupervisor {
    /// Create an empty supervisor.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            relays: Mutex::new(HashMap::new()),
            port_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Supervisor configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start a relay on `port` chained through `endpoint`.
    ///
    /// Any relay already on the port is torn down first. Returns the bound
    /// address once the new relay is listening.
    pub async fn start_on_port(
        &self,
        port: u16,
        endpoint: Endpoint,
    ) -> Result<SocketAddr, SupervisorError> {
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;

        self.teardown(port).await;

        let bind_addr = SocketAddr::new(self.config.bind_ip, port);
        let attempts = self.config.start_attempts.max(1);
        let mut attempt = 1;

        loop {
            match RelayHandle::spawn(bind_addr, endpoint.clone()).await {
                Ok(handle) => {
                    let local_addr = handle.local_addr();
                    self.relays.lock().await.insert(port, handle);
                    info!(
                        port,
                        local_addr = %local_addr,
                        upstream = %endpoint,
                        attempt,
                        "Relay started"
                    );
                    return Ok(local_addr);
                }
                Err(e) => {
                    warn!(
                        port,
                        attempt,
                        attempts,
                        error = %e,
                        reason = e.reason_code(),
                        "Failed to start relay"
                    );
                    if attempt >= attempts {
                        return Err(SupervisorError::StartFailed {
                            port,
                            attempts,
                            last: e,
                        });
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Stop and remove the relay on `port`, if any.
    pub async fn stop_on_port(&self, port: u16) {
        let lock = self.port_lock(port).await;
        let guard = lock.lock().await;
        self.teardown(port).await;
        drop(guard);
        self.release_port_lock(port, lock).await;
    }

    /// Stop every relay.
    pub async fn stop_all(&self) {
        let ports = self.active_ports().await;
        info!(count = ports.len(), "Stopping all relays");

        for port in ports {
            self.stop_on_port(port).await;
        }
    }

    /// Ports with an active relay, ascending.
    pub async fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.relays.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Observed state of the relay on `port`.
    pub async fn state_of(&self, port: u16) -> Option<RelayState> {
        self.relays.lock().await.get(&port).map(RelayHandle::state)
    }

    /// Bound address of the relay on `port`.
    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.relays.lock().await.get(&port).map(RelayHandle::local_addr)
    }

    /// Upstream of the relay on `port`.
    pub async fn upstream_of(&self, port: u16) -> Option<Endpoint> {
        self.relays
            .lock()
            .await
            .get(&port)
            .map(|handle| handle.upstream().clone())
    }

    /// Statistics of the relay on `port`.
    pub async fn stats(&self, port: u16) -> Option<RelayStatsSnapshot> {
        self.relays.lock().await.get(&port).map(RelayHandle::stats)
    }

    async fn port_lock(&self, port: u16) -> Arc<Mutex<()>> {
        let mut locks = self.port_locks.lock().await;
        Arc::clone(locks.entry(port).or_default())
    }

    /// Drop the lock entry for `port` unless another operation still holds a clone.
    async fn release_port_lock(&self, port: u16, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.port_locks.lock().await;
        if locks.get(&port).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&port);
        }
    }

    /// Stop, terminate and remove the relay on `port`. Caller holds the port lock.
    async fn teardown(&self, port: u16) {
        let stopper = self.relays.lock().await.get(&port).map(RelayHandle::stopper);
        let Some(stopper) = stopper else {
            return;
        };

        match stopper.stop(self.config.stop_timeout).await {
            StopOutcome::Stopped => debug!(port, "Relay acknowledged stop"),
            StopOutcome::AlreadyExited => debug!(port, "Relay had already exited"),
            StopOutcome::TimedOut => warn!(
                port,
                timeout_ms = self.config.stop_timeout.as_millis() as u64,
                "Relay did not acknowledge stop in time"
            ),
        }
        drop(stopper);

        let Some(handle) = self.relays.lock().await.remove(&port) else {
            return;
        };

        if !handle.terminate(self.config.join_timeout).await {
            warn!(
                port,
                timeout_ms = self.config.join_timeout.as_millis() as u64,
                "Relay thread still running after join timeout"
            );
        }

        tokio::time::sleep(self.config.settle_delay).await;
        info!(port, "Relay removed");
    }
}

impl std::fmt::Debug for RelaySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySupervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            start_attempts: 2,
            retry_delay: Duration::from_millis(10),
            stop_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_millis(10),
        }
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_stop_on_unknown_port_is_noop() {
        let supervisor = RelaySupervisor::new(config());
        supervisor.stop_on_port(1).await;
        assert!(supervisor.active_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let supervisor = RelaySupervisor::new(config());
        let port = free_port().await;

        let addr = supervisor
            .start_on_port(port, Endpoint::new("127.0.0.1", 9))
            .await
            .unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(supervisor.active_ports().await, vec![port]);
        assert_eq!(supervisor.state_of(port).await, Some(RelayState::Listening));
        assert_eq!(
            supervisor.upstream_of(port).await,
            Some(Endpoint::new("127.0.0.1", 9))
        );

        supervisor.stop_on_port(port).await;
        assert_eq!(supervisor.state_of(port).await, None);
        assert!(supervisor.active_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_port_locks_pruned_after_stop() {
        let supervisor = RelaySupervisor::new(config());
        let port = free_port().await;

        supervisor
            .start_on_port(port, Endpoint::new("127.0.0.1", 9))
            .await
            .unwrap();
        assert!(supervisor.port_locks.lock().await.contains_key(&port));

        supervisor.stop_on_port(port).await;
        assert!(supervisor.port_locks.lock().await.is_empty());

        supervisor.stop_on_port(port.wrapping_add(1)).await;
        assert!(supervisor.port_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_port_lock_kept_while_shared() {
        let supervisor = RelaySupervisor::new(config());
        let held = supervisor.port_lock(7).await;

        let other = supervisor.port_lock(7).await;
        supervisor.release_port_lock(7, other).await;
        assert!(supervisor.port_locks.lock().await.contains_key(&7));

        supervisor.release_port_lock(7, held).await;
        assert!(supervisor.port_locks.lock().await.is_empty());
    }
}
