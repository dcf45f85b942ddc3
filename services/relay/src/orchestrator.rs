//! Batch orchestration: "start K relays beginning at port P".

use std::sync::Arc;

use tracing::{info, warn};
use uniproxy_endpoint::Endpoint;

use crate::config::Config;
use crate::error::{BatchError, ResolveError};
use crate::resolver::{non_blank, Resolver};
use crate::supervisor::RelaySupervisor;

/// Overall result of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every requested port is relaying.
    Complete,
    /// Some ports are relaying, others failed.
    Partial,
    /// No port is relaying.
    Failed,
}

/// Per-batch bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Ports that started successfully.
    pub success_count: usize,
    /// Ports that failed, ascending.
    pub failed_ports: Vec<u16>,
    /// Number of ports requested.
    pub requested: usize,
    /// Why API resolution failed, if it did.
    pub resolution_error: Option<String>,
}

impl BatchResult {
    /// Classify the batch.
    pub fn outcome(&self) -> BatchOutcome {
        if self.success_count == 0 {
            BatchOutcome::Failed
        } else if self.failed_ports.is_empty() {
            BatchOutcome::Complete
        } else {
            BatchOutcome::Partial
        }
    }
}

/// Resolves upstreams and starts relays on a contiguous port range.
pub struct Orchestrator {
    resolver: Resolver,
    supervisor: Arc<RelaySupervisor>,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh resolver and supervisor.
    pub fn new(config: &Config) -> Result<Self, ResolveError> {
        let resolver = Resolver::new(config.resolver.clone())?;
        let supervisor = Arc::new(RelaySupervisor::new(config.supervisor.clone()));
        Ok(Self::with_parts(resolver, supervisor))
    }

    /// Create an orchestrator over existing components.
    pub fn with_parts(resolver: Resolver, supervisor: Arc<RelaySupervisor>) -> Self {
        Self {
            resolver,
            supervisor,
        }
    }

    /// The underlying supervisor.
    pub fn supervisor(&self) -> &Arc<RelaySupervisor> {
        &self.supervisor
    }

    /// Start `count` relays on ports `start_port..start_port + count`.
    ///
    /// With an API link, endpoints are assigned one per port in order; ports
    /// beyond the resolved entries fail without a start attempt. Otherwise the
    /// direct input is parsed once and shared by every port.
    pub async fn start_proxies(
        &self,
        direct: Option<&str>,
        api: Option<&str>,
        start_port: u16,
        count: usize,
    ) -> Result<BatchResult, BatchError> {
        validate_range(start_port, count)?;

        let direct = non_blank(direct);
        let api = non_blank(api);

        let mut result = BatchResult {
            requested: count,
            ..BatchResult::default()
        };
        let ports = (0..count).map(|offset| start_port + offset as u16);

        let endpoints: Vec<Endpoint> = match (api, direct) {
            (Some(api), _) => match self.resolver.fetch(api).await {
                Ok(endpoints) => {
                    if endpoints.len() < count {
                        warn!(
                            resolved = endpoints.len(),
                            requested = count,
                            "API returned fewer endpoints than requested ports"
                        );
                    }
                    endpoints
                }
                Err(e) => {
                    warn!(error = %e, reason = e.reason_code(), "Upstream resolution failed");
                    result.failed_ports.extend(ports);
                    result.resolution_error = Some(e.to_string());
                    return Ok(result);
                }
            },
            (None, Some(direct)) => {
                let endpoint = Endpoint::parse(direct)?;
                info!(upstream = %endpoint, "Using direct upstream for every port");
                vec![endpoint; count]
            }
            (None, None) => return Err(BatchError::MissingInput),
        };

        for (port, endpoint) in ports.clone().zip(endpoints) {
            match self.supervisor.start_on_port(port, endpoint).await {
                Ok(_) => result.success_count += 1,
                Err(e) => {
                    warn!(port, error = %e, reason = e.reason_code(), "Port failed");
                    result.failed_ports.push(port);
                }
            }
        }

        // Ports without an endpoint of their own.
        let assigned = result.success_count + result.failed_ports.len();
        result.failed_ports.extend(ports.skip(assigned));

        info!(
            requested = result.requested,
            started = result.success_count,
            failed = result.failed_ports.len(),
            "Batch finished"
        );
        Ok(result)
    }

    /// Stop every relay.
    pub async fn stop_all(&self) {
        self.supervisor.stop_all().await;
    }
}

/// The range must lie within 1..=65535.
fn validate_range(start_port: u16, count: usize) -> Result<(), BatchError> {
    if count == 0 {
        return Ok(());
    }
    let last = u64::from(start_port).saturating_add(count as u64 - 1);
    if start_port == 0 || last > u64::from(u16::MAX) {
        return Err(BatchError::PortRange { start_port, count });
    }
    Ok(())
}
