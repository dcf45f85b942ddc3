//! API body interpretation.
//!
//! A response body is offered to an ordered list of sniffers. Each one either
//! declines (`NoMatch`) or claims the body and returns its parse result; the
//! first claim wins.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uniproxy_endpoint::Endpoint;

use crate::error::ResolveError;

/// Message used when the API names no reason for an empty payload.
const NO_DATA_MESSAGE: &str = "API returned no data";

/// Keys accepted for each endpoint field, in lookup order.
const HOST_KEYS: &[&str] = &["host", "ip", "server"];
const PORT_KEYS: &[&str] = &["port"];
const USERNAME_KEYS: &[&str] = &["username", "user"];
const PASSWORD_KEYS: &[&str] = &["password", "pass"];

/// Result of offering a body to one sniffer.
#[derive(Debug)]
pub enum SniffOutcome {
    /// The sniffer claimed the body.
    Match(Result<Vec<Endpoint>, ResolveError>),
    /// The body is not in this sniffer's format.
    NoMatch,
}

/// A body sniffer: `(content_type, trimmed_body) -> outcome`.
type Sniffer = fn(Option<&str>, &str) -> SniffOutcome;

/// Sniffers in priority order.
const SNIFFERS: &[(&str, Sniffer)] = &[
    ("declared_json", sniff_declared_json),
    ("leading_bracket", sniff_leading_bracket),
    ("line_text", sniff_line_text),
];

/// Interpret an API body as a list of endpoints.
pub fn interpret(content_type: Option<&str>, body: &str) -> Result<Vec<Endpoint>, ResolveError> {
    let body = body.trim();
    for (name, sniffer) in SNIFFERS {
        if let SniffOutcome::Match(result) = sniffer(content_type, body) {
            debug!(sniffer = name, "API body matched");
            return result;
        }
    }
    Err(ResolveError::NoEndpoints)
}

fn sniff_declared_json(content_type: Option<&str>, body: &str) -> SniffOutcome {
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().contains("json") => SniffOutcome::Match(parse_json(body)),
        _ => SniffOutcome::NoMatch,
    }
}

fn sniff_leading_bracket(_content_type: Option<&str>, body: &str) -> SniffOutcome {
    if body.starts_with('{') || body.starts_with('[') {
        SniffOutcome::Match(parse_json(body))
    } else {
        SniffOutcome::NoMatch
    }
}

fn sniff_line_text(_content_type: Option<&str>, body: &str) -> SniffOutcome {
    SniffOutcome::Match(parse_lines(body))
}

// =============================================================================
// JSON
// =============================================================================

/// Top-level fields of a JSON API response.
#[derive(Debug, Default, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    success: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    msg: Option<Value>,
}

impl ApiEnvelope {
    fn failure_message(&self) -> String {
        match &self.msg {
            Some(Value::String(msg)) => msg.clone(),
            Some(Value::Null) | None => NO_DATA_MESSAGE.to_string(),
            Some(other) => other.to_string(),
        }
    }
}

fn parse_json(body: &str) -> Result<Vec<Endpoint>, ResolveError> {
    let document: Value = serde_json::from_str(body)?;
    let Value::Object(top) = document else {
        return Err(ResolveError::Semantic(
            "API response is not a JSON object".to_string(),
        ));
    };

    let envelope: ApiEnvelope = serde_json::from_value(Value::Object(top.clone()))?;

    let reported_failure = matches!(envelope.success, Some(Value::Bool(false)));
    let data = match &envelope.data {
        Some(Value::Null) | None => None,
        Some(data) => Some(data),
    };

    let data = match data {
        Some(data) if !reported_failure => data,
        _ => return Err(ResolveError::Semantic(envelope.failure_message())),
    };

    match data {
        Value::Array(entries) => Ok(entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let result = match entry {
                    Value::Object(fields) => extract_endpoint(&[fields]),
                    _ => Err("entry is not an object"),
                };
                match result {
                    Ok(endpoint) => Some(endpoint),
                    Err(reason) => {
                        warn!(index, reason, "Skipping API entry");
                        None
                    }
                }
            })
            .collect()),
        Value::Object(fields) => extract_endpoint(&[fields, &top])
            .map(|endpoint| vec![endpoint])
            .map_err(|reason| ResolveError::Semantic(reason.to_string())),
        _ => extract_endpoint(&[&top])
            .map(|endpoint| vec![endpoint])
            .map_err(|reason| ResolveError::Semantic(reason.to_string())),
    }
}

/// Build an endpoint from the first source object that carries each field.
fn extract_endpoint(sources: &[&Map<String, Value>]) -> Result<Endpoint, &'static str> {
    let host = lookup(sources, HOST_KEYS)
        .and_then(scalar_string)
        .filter(|host| !host.is_empty())
        .ok_or("host field missing or empty")?;

    let port = lookup(sources, PORT_KEYS)
        .and_then(port_value)
        .ok_or("port field missing or invalid")?;

    let mut endpoint = Endpoint::new(host, port);
    endpoint.username = lookup(sources, USERNAME_KEYS).and_then(scalar_string);
    endpoint.password = lookup(sources, PASSWORD_KEYS).and_then(scalar_string);
    Ok(endpoint)
}

/// First non-null, non-empty value for any of `keys`, searching sources in order.
fn lookup<'a>(sources: &[&'a Map<String, Value>], keys: &[&str]) -> Option<&'a Value> {
    sources.iter().copied().find_map(|source| {
        keys.iter()
            .filter_map(|key| source.get(*key))
            .find(|value| !is_blank(value))
    })
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => match n.as_u64() {
            Some(n) => u16::try_from(n).ok(),
            // Integral floats such as 1080.0.
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(f))
                .map(|f| f as u16),
        },
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }?;
    (port != 0).then_some(port)
}

// =============================================================================
// Text
// =============================================================================

fn parse_lines(body: &str) -> Result<Vec<Endpoint>, ResolveError> {
    let endpoints: Vec<Endpoint> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match Endpoint::parse(line) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(line, error = %e, "Skipping unparseable API line");
                None
            }
        })
        .collect();

    if endpoints.is_empty() {
        return Err(ResolveError::NoEndpoints);
    }
    Ok(endpoints)
}
