//! Container registry adapter (Docker Registry v2 API)

use super::{base_url, RegistrySource, SourceResult};
use crate::config::RegistrySettings;
use crate::error::SourceError;
use crate::models::StringMap;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const SOURCE: &str = "registry";

#[derive(Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct HttpRegistrySource {
    tiers: BTreeMap<String, Url>,
    client: Client,
}

impl HttpRegistrySource {
    pub fn new(settings: &RegistrySettings) -> SourceResult<Self> {
        let tiers = settings
            .tiers
            .iter()
            .map(|(tier, url)| base_url(SOURCE, url).map(|u| (tier.clone(), u)))
            .collect::<SourceResult<_>>()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        Ok(Self { tiers, client })
    }

    async fn fetch(&self, tier: &str, path: &str) -> SourceResult<Value> {
        let base = self.tiers.get(tier).ok_or_else(|| SourceError::Unavailable {
            source_name: SOURCE,
            message: format!("no such registry tier {}", tier),
        })?;
        let url = base
            .join(path)
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;

        debug!(tier, url = %url, "Registry request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(SOURCE, e))?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                source_name: SOURCE,
                status: response.status().as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::malformed(SOURCE, e.to_string()))
    }
}

#[async_trait]
impl RegistrySource for HttpRegistrySource {
    fn tiers(&self) -> Vec<String> {
        self.tiers.keys().cloned().collect()
    }

    async fn list_images(&self, tier: &str) -> SourceResult<Vec<String>> {
        let body = self.fetch(tier, "v2/_catalog").await?;
        let catalog: Catalog =
            serde_json::from_value(body).map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;
        Ok(catalog.repositories.unwrap_or_default())
    }

    async fn list_tags(&self, tier: &str, image: &str) -> SourceResult<Vec<String>> {
        let body = self.fetch(tier, &format!("v2/{}/tags/list", image)).await?;
        let tags: TagList =
            serde_json::from_value(body).map_err(|e| SourceError::malformed(SOURCE, e.to_string()))?;
        Ok(tags.tags.unwrap_or_default())
    }

    async fn list_labels(&self, tier: &str, image: &str, tag: &str) -> SourceResult<StringMap> {
        let manifest = self
            .fetch(tier, &format!("v2/{}/manifests/{}", image, tag))
            .await?;
        extract_labels(&manifest)
    }
}

/// Merge `config.Labels` of every `history[].v1Compatibility` entry of a
/// schema-1 manifest. Entries without labels contribute nothing.
pub fn extract_labels(manifest: &Value) -> SourceResult<StringMap> {
    let history = manifest
        .get("history")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::malformed(SOURCE, "manifest has no history"))?;

    let mut labels = StringMap::new();
    for entry in history {
        let raw = entry
            .get("v1Compatibility")
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::malformed(SOURCE, "history entry has no v1Compatibility"))?;
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|e| SourceError::malformed(SOURCE, format!("v1Compatibility: {}", e)))?;

        if let Some(found) = parsed
            .get("config")
            .and_then(|c| c.get("Labels"))
            .and_then(Value::as_object)
        {
            for (key, value) in found {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                labels.insert(key.clone(), value);
            }
        }
    }

    Ok(labels)
}
