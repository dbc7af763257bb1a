//! Metrics backend adapter
//!
//! Ad-hoc queries go to the Prometheus HTTP API. Node usage comes from the
//! cluster's metrics API through the shared [`KubeClient`].

use super::{base_url, KubeClient, MetricsSource, SourceResult};
use crate::config::PrometheusSettings;
use crate::error::SourceError;
use crate::models::StringMap;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const SOURCE: &str = "prometheus";
const METRICS_API: &str = "apis/metrics.k8s.io/v1beta1/nodes/";
const QUERY_PATH: &str = "api/v1/query";

/// Raw usage quantities of one node
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeUsage {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Deserialize)]
struct NodeMetrics {
    #[serde(default)]
    usage: NodeUsage,
}

/// One element of a query result
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: StringMap,
    pub value: f64,
}

pub struct PrometheusSource {
    base_url: Url,
    client: Client,
    kube: Arc<KubeClient>,
}

impl PrometheusSource {
    pub fn new(settings: &PrometheusSettings, kube: Arc<KubeClient>) -> SourceResult<Self> {
        Self::with_url(&settings.url, Duration::from_secs(settings.timeout_secs), kube)
    }

    pub fn with_url(url: &str, timeout: Duration, kube: Arc<KubeClient>) -> SourceResult<Self> {
        let base_url = base_url(SOURCE, url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        Ok(Self {
            base_url,
            client,
            kube,
        })
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn node_usage(&self, node: &str) -> SourceResult<NodeUsage> {
        let path = format!("{}{}", METRICS_API, node);
        let metrics: NodeMetrics = self.kube.get_json(&path, &[]).await?;
        Ok(metrics.usage)
    }

    async fn query(&self, expr: &str) -> SourceResult<Vec<Sample>> {
        let url = self
            .base_url
            .join(QUERY_PATH)
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;

        debug!(query = expr, "Metrics query");
        let response = self
            .client
            .get(url)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: SOURCE,
                status: response.status().as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;

        parse_query_response(&body)
    }
}

/// Decode `{data: {resultType, result}}` or a bare `{result}` body
pub fn parse_query_response(body: &Value) -> SourceResult<Vec<Sample>> {
    let data = body.get("data").unwrap_or(body);
    let result = data
        .get("result")
        .ok_or_else(|| SourceError::malformed(SOURCE, "response has no result"))?;

    match data.get("resultType").and_then(Value::as_str) {
        Some("scalar") => Ok(vec![Sample {
            labels: StringMap::new(),
            value: sample_value(result)?,
        }]),
        _ => {
            let items = result
                .as_array()
                .ok_or_else(|| SourceError::malformed(SOURCE, "result is not a list"))?;
            Ok(items
                .iter()
                .filter_map(|item| match parse_sample(item) {
                    Ok(sample) => Some(sample),
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed sample");
                        None
                    }
                })
                .collect())
        }
    }
}

fn parse_sample(item: &Value) -> SourceResult<Sample> {
    let labels = item
        .get("metric")
        .and_then(Value::as_object)
        .map(|metric| {
            metric
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let value = item
        .get("value")
        .ok_or_else(|| SourceError::malformed(SOURCE, "sample has no value"))?;

    Ok(Sample {
        labels,
        value: sample_value(value)?,
    })
}

/// `[timestamp, "value"]`
fn sample_value(pair: &Value) -> SourceResult<f64> {
    let raw = pair
        .get(1)
        .ok_or_else(|| SourceError::malformed(SOURCE, "sample value is not a pair"))?;

    match raw {
        Value::String(s) => s
            .parse()
            .map_err(|_| SourceError::malformed(SOURCE, format!("non-numeric sample {:?}", s))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SourceError::malformed(SOURCE, "sample out of range")),
        other => Err(SourceError::malformed(
            SOURCE,
            format!("unexpected sample {}", other),
        )),
    }
}
