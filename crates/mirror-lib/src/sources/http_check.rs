//! Generic HTTP health checks
//!
//! Transport failures never surface as errors: a timeout becomes a
//! synthetic `408 TIMEDOUT` response and any other failure a
//! `400 CONNECTION FAILED`, so classification has a single shape to handle.

use super::{HttpProbe, SourceResult};
use crate::config::{CheckSpec, CheckType};
use crate::error::SourceError;
use crate::models::HealthCheck;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest response body kept as check details
const MAX_DETAILS: usize = 4096;

/// Status code, reason phrase and body of one probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub code: u16,
    pub message: String,
    pub body: String,
}

impl ProbeResponse {
    pub fn timed_out() -> Self {
        Self {
            code: 408,
            message: "TIMEDOUT".to_string(),
            body: String::new(),
        }
    }

    pub fn connection_failed() -> Self {
        Self {
            code: 400,
            message: "CONNECTION FAILED".to_string(),
            body: String::new(),
        }
    }

    fn status_line(&self) -> String {
        format!("{} {}", self.code, self.message)
    }
}

/// [`HttpProbe`] over reqwest; certificates are not verified
pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new() -> SourceResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SourceError::from_reqwest("checks", e))?;
        Ok(Self { client })
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid check header"),
        }
    }
    map
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(
        &self,
        uri: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> ProbeResponse {
        debug!(uri, "Probing health check target");
        let result = self
            .client
            .get(uri)
            .headers(header_map(headers))
            .timeout(timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return ProbeResponse::timed_out(),
            Err(e) => {
                debug!(uri, error = %e, "Health check transport failure");
                return ProbeResponse::connection_failed();
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return ProbeResponse::timed_out(),
            Err(_) => String::new(),
        };

        ProbeResponse {
            code: status.as_u16(),
            message: status.canonical_reason().unwrap_or("").to_string(),
            body,
        }
    }
}

/// Turn a probe response into the cached health-check row
pub fn classify_check(name: &str, spec: &CheckSpec, response: &ProbeResponse) -> HealthCheck {
    let (result, healthy) = match spec.check_type {
        CheckType::ResponseCode => classify_response_code(spec, response),
        CheckType::Json => classify_json(spec, response),
    };

    HealthCheck {
        name: name.to_string(),
        uri: spec.uri.clone(),
        result,
        details: truncate(&response.body),
        healthy,
    }
}

fn classify_response_code(spec: &CheckSpec, response: &ProbeResponse) -> (String, Option<bool>) {
    let overridden = spec.response_codes.get(&response.code.to_string());
    let message = overridden.unwrap_or(&response.message);
    let success = StatusCode::from_u16(response.code)
        .map(|s| s.is_success())
        .unwrap_or(false);

    (
        format!("{} {}", response.code, message),
        Some(success || overridden.is_some()),
    )
}

fn classify_json(spec: &CheckSpec, response: &ProbeResponse) -> (String, Option<bool>) {
    let Some(path) = spec.value.as_deref() else {
        return ("ERROR: json check has no value path".to_string(), Some(false));
    };

    let body: Value = match serde_json::from_str(&response.body) {
        Ok(body) => body,
        Err(_) => return (response.status_line(), Some(false)),
    };

    match lookup_path(&body, path) {
        Some(found) => {
            let value = match found {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let healthy = spec.expected.as_ref().map(|expected| *expected == value);
            (value, healthy)
        }
        None => (format!("ERROR: field {} not found", path), Some(false)),
    }
}

/// Follow a dotted path through objects and arrays
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truncate(body: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if body.len() <= MAX_DETAILS {
        return Some(body.to_string());
    }
    let mut end = MAX_DETAILS;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    Some(body[..end].to_string())
}
