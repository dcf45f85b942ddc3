//! Relay service configuration.
//!
//! Defaults match the timings the relays were tuned for; every value can be
//! overridden through `UNIPROXY_*` environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{Context, Result};

/// Default HTTP timeout for API resolution.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of API fetch attempts.
pub const DEFAULT_API_ATTEMPTS: u32 = 2;

/// Default delay between API fetch attempts.
pub const DEFAULT_API_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default number of attempts to start a relay on one port.
pub const DEFAULT_START_ATTEMPTS: u32 = 3;

/// Default delay between relay start attempts.
pub const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default bound on waiting for a relay to close its listener.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on waiting for a relay thread to exit.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default pause after teardown so the OS releases the port.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Upstream-source resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Timeout for a single API request.
    pub timeout: Duration,
    /// Total fetch attempts (network, parse and semantic failures all count).
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_API_TIMEOUT,
            attempts: DEFAULT_API_ATTEMPTS,
            retry_delay: DEFAULT_API_RETRY_DELAY,
        }
    }
}

/// Relay supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Local address relays bind on.
    pub bind_ip: IpAddr,
    /// Attempts to start a relay before reporting the port as failed.
    pub start_attempts: u32,
    /// Delay between start attempts.
    pub retry_delay: Duration,
    /// Bound on waiting for a relay to acknowledge stop.
    pub stop_timeout: Duration,
    /// Bound on waiting for a relay thread to exit.
    pub join_timeout: Duration,
    /// Pause after teardown before the port may be bound again.
    pub settle_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            start_attempts: DEFAULT_START_ATTEMPTS,
            retry_delay: DEFAULT_START_RETRY_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolver settings.
    pub resolver: ResolverConfig,

    /// Supervisor settings.
    pub supervisor: SupervisorConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the compact format.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            supervisor: SupervisorConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(lookup(key)
                .map(|v| v.parse::<u64>())
                .transpose()
                .with_context(|| format!("{key} must be an integer (milliseconds)."))?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };
        let count = |key: &str, default: u32| -> Result<u32> {
            Ok(lookup(key)
                .map(|v| v.parse::<u32>())
                .transpose()
                .with_context(|| format!("{key} must be a positive integer."))?
                .unwrap_or(default)
                .max(1))
        };

        let resolver = ResolverConfig {
            timeout: millis("UNIPROXY_API_TIMEOUT_MS", DEFAULT_API_TIMEOUT)?,
            attempts: count("UNIPROXY_API_ATTEMPTS", DEFAULT_API_ATTEMPTS)?,
            retry_delay: millis("UNIPROXY_API_RETRY_DELAY_MS", DEFAULT_API_RETRY_DELAY)?,
        };

        let bind_ip = lookup("UNIPROXY_BIND_IP")
            .map(|v| v.parse::<IpAddr>())
            .transpose()
            .context("UNIPROXY_BIND_IP must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let supervisor = SupervisorConfig {
            bind_ip,
            start_attempts: count("UNIPROXY_START_ATTEMPTS", DEFAULT_START_ATTEMPTS)?,
            retry_delay: millis("UNIPROXY_START_RETRY_DELAY_MS", DEFAULT_START_RETRY_DELAY)?,
            stop_timeout: millis("UNIPROXY_STOP_TIMEOUT_MS", DEFAULT_STOP_TIMEOUT)?,
            join_timeout: millis("UNIPROXY_JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT)?,
            settle_delay: millis("UNIPROXY_SETTLE_DELAY_MS", DEFAULT_SETTLE_DELAY)?,
        };

        let log_level = lookup("UNIPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_json = lookup("UNIPROXY_LOG_JSON")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            resolver,
            supervisor,
            log_level,
            log_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.resolver.timeout, Duration::from_secs(30));
        assert_eq!(config.resolver.attempts, 2);
        assert_eq!(config.resolver.retry_delay, Duration::from_secs(2));
        assert_eq!(config.supervisor.start_attempts, 3);
        assert_eq!(config.supervisor.retry_delay, Duration::from_secs(1));
        assert_eq!(config.supervisor.stop_timeout, Duration::from_secs(2));
        assert_eq!(config.supervisor.join_timeout, Duration::from_secs(3));
        assert_eq!(config.supervisor.settle_delay, Duration::from_millis(500));
        assert!(config.supervisor.bind_ip.is_unspecified());
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("UNIPROXY_API_ATTEMPTS", "5"),
            ("UNIPROXY_SETTLE_DELAY_MS", "50"),
            ("UNIPROXY_BIND_IP", "127.0.0.1"),
            ("UNIPROXY_LOG_JSON", "TRUE"),
        ]))
        .unwrap();
        assert_eq!(config.resolver.attempts, 5);
        assert_eq!(config.supervisor.settle_delay, Duration::from_millis(50));
        assert_eq!(config.supervisor.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.log_json);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let config =
            Config::from_lookup(lookup_from(&[("UNIPROXY_START_ATTEMPTS", "0")])).unwrap();
        assert_eq!(config.supervisor.start_attempts, 1);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let err = Config::from_lookup(lookup_from(&[("UNIPROXY_STOP_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("UNIPROXY_STOP_TIMEOUT_MS"));
    }
}
