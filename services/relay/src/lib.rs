//! uniproxy relay
//!
//! Multiplexes N local SOCKS5 listeners onto upstream SOCKS5 proxies.
//!
//! - [`resolver`] turns direct input or an API response into endpoints
//! - [`relay`] runs one SOCKS5-to-SOCKS5 relay per local port
//! - [`supervisor`] keeps at most one relay per port
//! - [`orchestrator`] starts a contiguous range of relays as one batch

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod relay;
pub mod resolver;
pub mod supervisor;

pub use config::{Config, ResolverConfig, SupervisorConfig};
pub use error::{BatchError, RelayError, ResolveError, SupervisorError};
pub use orchestrator::{BatchOutcome, BatchResult, Orchestrator};
pub use relay::{RelayHandle, RelayState, RelayStatsSnapshot};
pub use resolver::Resolver;
pub use supervisor::RelaySupervisor;
pub use uniproxy_endpoint::{Endpoint, FormatError};
