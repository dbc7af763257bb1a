//! Cluster API adapter
//!
//! Talks to the API server with the pod's service-account token and CA
//! certificate. The token is re-read on every request so rotated tokens
//! are picked up without a reload.

use super::{ClusterSource, Listing, SourceResult, Undecodable};
use crate::config::ClusterSettings;
use crate::error::SourceError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod};
use reqwest::{Certificate, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const SOURCE: &str = "cluster";

/// `items` of a list response; each item is decoded on its own
#[derive(Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<Value>,
}

/// Metadata field a kind is cached under
#[derive(Debug, Clone, Copy)]
enum KeyField {
    Name,
    Uid,
}

impl KeyField {
    fn read(self, item: &Value) -> Option<String> {
        let field = match self {
            KeyField::Name => "name",
            KeyField::Uid => "uid",
        };
        item.get("metadata")?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }
}

/// Decode list items one by one
fn decode_items<T: DeserializeOwned>(items: Vec<Value>, key: KeyField) -> Listing<T> {
    let mut listing = Listing::from(Vec::with_capacity(items.len()));
    for item in items {
        let item_key = key.read(&item);
        match serde_json::from_value(item) {
            Ok(decoded) => listing.items.push(decoded),
            Err(e) => {
                warn!(key = ?item_key, error = %e, "Undecodable list item");
                listing.undecodable.push(Undecodable {
                    key: item_key,
                    reason: e.to_string(),
                });
            }
        }
    }
    listing
}

/// Authenticated HTTP client for the API server
pub struct KubeClient {
    base_url: Url,
    client: Client,
    token_path: PathBuf,
}

impl KubeClient {
    /// Build a client from settings, loading the CA certificate if present
    pub fn from_settings(settings: &ClusterSettings) -> SourceResult<Self> {
        let ca_path = settings.ca_path();
        let ca_pem = match std::fs::read(&ca_path) {
            Ok(pem) => Some(pem),
            Err(e) => {
                warn!(path = %ca_path.display(), error = %e, "CA certificate not readable, using system roots");
                None
            }
        };

        info!(url = %settings.url, secrets_dir = %settings.secrets_dir().display(), "Initializing cluster client");
        Self::new(&settings.url, settings.token_path(), ca_pem, settings.timeout())
    }

    pub fn new(
        base_url: &str,
        token_path: impl Into<PathBuf>,
        ca_pem: Option<Vec<u8>>,
        timeout: Duration,
    ) -> SourceResult<Self> {
        let base_url = super::base_url(SOURCE, base_url)?;

        let mut builder = Client::builder().timeout(timeout);
        if let Some(pem) = ca_pem {
            let cert = Certificate::from_pem(&pem).map_err(|e| SourceError::Unavailable {
                source_name: SOURCE,
                message: format!("invalid CA certificate: {}", e),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        Ok(Self {
            base_url,
            client,
            token_path: token_path.into(),
        })
    }

    async fn bearer_token(&self) -> SourceResult<Option<String>> {
        match tokio::fs::read_to_string(&self.token_path).await {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceError::Unavailable {
                source_name: SOURCE,
                message: format!("failed to read token {}: {}", self.token_path.display(), e),
            }),
        }
    }

    /// GET a path relative to the API server and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> SourceResult<T> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;

        debug!(url = %url, "Cluster request");
        let mut request = self.client.get(url).query(query);
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SourceError::Unavailable {
                    source_name: SOURCE,
                    message: format!("authorization rejected ({})", response.status()),
                })
            }
            status if !status.is_success() => {
                return Err(SourceError::Status {
                    source_name: SOURCE,
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        key: KeyField,
    ) -> SourceResult<Listing<T>> {
        let list: ItemList = self.get_json(path, query).await?;
        Ok(decode_items(list.items, key))
    }
}

/// [`ClusterSource`] backed by the API server
pub struct KubeClusterSource {
    client: Arc<KubeClient>,
    node_selector: String,
}

impl KubeClusterSource {
    pub fn new(client: Arc<KubeClient>, node_selector: impl Into<String>) -> Self {
        Self {
            client,
            node_selector: node_selector.into(),
        }
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn list_nodes(&self) -> SourceResult<Listing<Node>> {
        let selector = [("labelSelector", self.node_selector.as_str())];
        let query: &[(&str, &str)] = if self.node_selector.is_empty() {
            &[]
        } else {
            &selector
        };
        self.client.list("/api/v1/nodes", query, KeyField::Name).await
    }

    async fn list_namespaces(&self) -> SourceResult<Listing<Namespace>> {
        self.client.list("/api/v1/namespaces", &[], KeyField::Uid).await
    }

    async fn list_deployments(&self) -> SourceResult<Listing<Deployment>> {
        self.client
            .list("/apis/apps/v1/deployments", &[], KeyField::Uid)
            .await
    }

    async fn list_replica_sets(&self) -> SourceResult<Listing<ReplicaSet>> {
        self.client
            .list("/apis/apps/v1/replicasets", &[], KeyField::Uid)
            .await
    }

    async fn list_pods(&self) -> SourceResult<Listing<Pod>> {
        self.client.list("/api/v1/pods", &[], KeyField::Uid).await
    }

    async fn list_events(&self) -> SourceResult<Listing<Event>> {
        self.client.list("/api/v1/events", &[], KeyField::Uid).await
    }
}
