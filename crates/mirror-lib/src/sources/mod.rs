//! Adapters over the external data sources
//!
//! Each source is a trait so the reconciler can be driven by in-memory
//! fakes in tests. Every production implementation carries a bounded
//! request timeout.

mod cluster;
mod http_check;
mod metrics;
mod registry;

pub use cluster::{KubeClient, KubeClusterSource};
pub use http_check::{classify_check, ProbeResponse, ReqwestProbe};
pub use metrics::{NodeUsage, PrometheusSource, Sample};
pub use registry::{extract_labels, HttpRegistrySource};

use crate::config::Settings;
use crate::error::SourceError;
use crate::models::StringMap;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Parse a configured base URL. The path always ends in `/` so that
/// relative joins keep any prefix the server is mounted under.
pub(crate) fn base_url(source_name: &'static str, raw: &str) -> SourceResult<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| SourceError::malformed(source_name, format!("invalid url {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// A list item whose shape did not decode. `key` is the item's cache key
/// when it could still be read from its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Undecodable {
    pub key: Option<String>,
    pub reason: String,
}

/// One list response: the items that decoded and the ones that did not
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub undecodable: Vec<Undecodable>,
}

impl<T> Listing<T> {
    /// Every item the source returned, decodable or not
    pub fn len(&self) -> usize {
        self.items.len() + self.undecodable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items,
            undecodable: Vec::new(),
        }
    }
}

/// Full-refresh listing of cluster resources
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_nodes(&self) -> SourceResult<Listing<Node>>;
    async fn list_namespaces(&self) -> SourceResult<Listing<Namespace>>;
    async fn list_deployments(&self) -> SourceResult<Listing<Deployment>>;
    async fn list_replica_sets(&self) -> SourceResult<Listing<ReplicaSet>>;
    async fn list_pods(&self) -> SourceResult<Listing<Pod>>;
    async fn list_events(&self) -> SourceResult<Listing<Event>>;
}

/// Node usage and ad-hoc time-series queries
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Current CPU and memory usage of a node, as raw quantity strings
    async fn node_usage(&self, node: &str) -> SourceResult<NodeUsage>;

    /// Instant vector or scalar query
    async fn query(&self, expr: &str) -> SourceResult<Vec<Sample>>;
}

/// First sample's value of a query, `None` when the query returned nothing
pub async fn single_value(metrics: &dyn MetricsSource, expr: &str) -> SourceResult<Option<f64>> {
    Ok(metrics.query(expr).await?.into_iter().next().map(|s| s.value))
}

/// Image catalog, tags and manifest labels per registry tier
#[async_trait]
pub trait RegistrySource: Send + Sync {
    fn tiers(&self) -> Vec<String>;
    async fn list_images(&self, tier: &str) -> SourceResult<Vec<String>>;
    async fn list_tags(&self, tier: &str, image: &str) -> SourceResult<Vec<String>>;
    async fn list_labels(&self, tier: &str, image: &str, tag: &str) -> SourceResult<StringMap>;
}

/// GET against an arbitrary URL; transport failures come back as synthetic responses
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn get(
        &self,
        uri: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> ProbeResponse;
}

/// The set of adapters one cycle runs against
#[derive(Clone)]
pub struct Sources {
    pub cluster: Arc<dyn ClusterSource>,
    pub metrics: Arc<dyn MetricsSource>,
    pub registry: Arc<dyn RegistrySource>,
    pub probe: Arc<dyn HttpProbe>,
}

impl Sources {
    /// Build the production adapters from settings
    pub fn connect(settings: &Settings) -> SourceResult<Self> {
        let kube = Arc::new(KubeClient::from_settings(&settings.cluster)?);
        let cluster = KubeClusterSource::new(kube.clone(), settings.cluster.node_selector.clone());
        let metrics = PrometheusSource::new(&settings.prometheus, kube)?;
        let registry = HttpRegistrySource::new(&settings.registry)?;
        let probe = ReqwestProbe::new()?;

        Ok(Self {
            cluster: Arc::new(cluster),
            metrics: Arc::new(metrics),
            registry: Arc::new(registry),
            probe: Arc::new(probe),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_prefix_for_relative_joins() {
        let with_slash = base_url("metrics", "http://host:9090/prometheus/").unwrap();
        let without_slash = base_url("metrics", "http://host:9090/prometheus").unwrap();
        let root = base_url("metrics", "http://host:9090").unwrap();

        assert_eq!(with_slash, without_slash);
        assert_eq!(
            with_slash.join("api/v1/query").unwrap().as_str(),
            "http://host:9090/prometheus/api/v1/query"
        );
        assert_eq!(root.join("v2/_catalog").unwrap().as_str(), "http://host:9090/v2/_catalog");
    }

    #[test]
    fn test_invalid_base_url_is_malformed() {
        assert!(base_url("registry", "not a url").unwrap_err().is_malformed());
    }
}
