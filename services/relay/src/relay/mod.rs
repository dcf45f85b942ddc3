//! Per-port SOCKS5 relay.
//!
//! Clients speak SOCKS5 (no authentication, CONNECT only) to a local
//! listener; every session is chained through one upstream SOCKS5 proxy.

mod engine;
mod forward;
mod handle;
pub mod socks5;
mod upstream;

pub use engine::{RelayCommand, RelayEngine, RelayState, RelayStats, RelayStatsSnapshot};
pub use forward::{relay_bidirectional, Transferred, FORWARD_BUFFER_SIZE};
pub use handle::{RelayHandle, RelayStopper, StopOutcome};
pub use upstream::connect_through;
