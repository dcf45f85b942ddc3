//! Upstream source resolution.
//!
//! Turns either a literal `host:port[:user:pass]` string or a remote API
//! response into an ordered list of upstream endpoints.

mod sniff;

pub use sniff::{interpret, SniffOutcome};

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};
use uniproxy_endpoint::Endpoint;

use crate::config::ResolverConfig;
use crate::error::ResolveError;

/// Number of body characters included in debug logs.
const BODY_LOG_PREVIEW: usize = 200;

/// Treats blank strings as absent.
pub fn non_blank(input: Option<&str>) -> Option<&str> {
    input.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse direct user input into a single endpoint.
pub fn parse_direct(input: &str) -> Result<Endpoint, ResolveError> {
    Ok(Endpoint::parse(input)?)
}

/// Resolves upstream endpoints from direct input or an API.
pub struct Resolver {
    client: reqwest::Client,
    config: ResolverConfig,
}

impl Resolver {
    /// Create a resolver with its own HTTP client.
    pub fn new(config: ResolverConfig) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Resolve endpoints. The API link takes precedence over direct input.
    pub async fn resolve(
        &self,
        direct: Option<&str>,
        api: Option<&str>,
    ) -> Result<Vec<Endpoint>, ResolveError> {
        match (non_blank(direct), non_blank(api)) {
            (_, Some(api)) => self.fetch(api).await,
            (Some(direct), None) => Ok(vec![parse_direct(direct)?]),
            (None, None) => Err(ResolveError::MissingInput),
        }
    }

    /// Fetch and interpret the API response, retrying any failure.
    pub async fn fetch(&self, url: &str) -> Result<Vec<Endpoint>, ResolveError> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(url, attempt, attempts, "Requesting upstream list from API");

            match self.fetch_once(url).await {
                Ok(endpoints) => {
                    info!(url, count = endpoints.len(), "Resolved upstream endpoints");
                    return Ok(endpoints);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        url,
                        attempt,
                        attempts,
                        error = %e,
                        reason = e.reason_code(),
                        "API resolution failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        url,
                        attempts,
                        error = %e,
                        reason = e.reason_code(),
                        "API resolution failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<Endpoint>, ResolveError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        debug!(
            content_type = content_type.as_deref().unwrap_or(""),
            body = %body.chars().take(BODY_LOG_PREVIEW).collect::<String>(),
            "API response received"
        );

        interpret(content_type.as_deref(), &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resolver() -> Resolver {
        Resolver::new(ResolverConfig {
            timeout: Duration::from_secs(1),
            attempts: 1,
            retry_delay: Duration::from_millis(1),
        })
        .unwrap()
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(None), None);
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(Some(" a:1 ")), Some("a:1"));
    }

    #[tokio::test]
    async fn test_resolve_direct() {
        let endpoints = resolver()
            .resolve(Some("1.2.3.4:1080:user:pass"), Some("  "))
            .await
            .unwrap();
        assert_eq!(
            endpoints,
            vec![Endpoint::new("1.2.3.4", 1080).with_credentials("user", "pass")]
        );
    }

    #[tokio::test]
    async fn test_resolve_direct_malformed() {
        let err = resolver()
            .resolve(Some("1.2.3.4:1080:user"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Format(_)));
        assert_eq!(err.reason_code(), "format_error");
    }

    #[tokio::test]
    async fn test_resolve_missing_input() {
        let err = resolver().resolve(Some(""), None).await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingInput));
    }
}
