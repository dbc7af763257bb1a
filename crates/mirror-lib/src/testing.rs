//! In-memory sources and object builders shared by unit tests

use crate::config::Settings;
use crate::context::Context;
use crate::error::SourceError;
use crate::health::HealthRegistry;
use crate::models::{EntityKind, Node, StringMap};
use crate::observability::StructuredLogger;
use crate::sources::{
    ClusterSource, HttpProbe, Listing, MetricsSource, NodeUsage, ProbeResponse, RegistrySource,
    Sample, SourceResult, Sources, Undecodable,
};
use crate::store::Store;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1 as core;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn unavailable(source_name: &'static str) -> SourceError {
    SourceError::Unavailable {
        source_name,
        message: "connection reset by peer".to_string(),
    }
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}

#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Mutex<Vec<core::Node>>,
    pub namespaces: Mutex<Vec<core::Namespace>>,
    pub deployments: Mutex<Vec<apps::Deployment>>,
    pub replica_sets: Mutex<Vec<apps::ReplicaSet>>,
    pub pods: Mutex<Vec<core::Pod>>,
    pub events: Mutex<Vec<core::Event>>,
    pub failing: Mutex<HashSet<EntityKind>>,
    pub undecodable: Mutex<HashMap<EntityKind, Vec<Undecodable>>>,
}

impl FakeCluster {
    pub fn fail(&self, kind: EntityKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Add an item of `kind` that fails to decode
    pub fn garble(&self, kind: EntityKind, key: Option<&str>) {
        self.undecodable
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Undecodable {
                key: key.map(str::to_string),
                reason: "invalid type: string \"oops\", expected a sequence".to_string(),
            });
    }

    fn list<T: Clone>(&self, kind: EntityKind, items: &Mutex<Vec<T>>) -> SourceResult<Listing<T>> {
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(unavailable("cluster"));
        }
        Ok(Listing {
            items: items.lock().unwrap().clone(),
            undecodable: self
                .undecodable
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn list_nodes(&self) -> SourceResult<Listing<core::Node>> {
        self.list(EntityKind::Node, &self.nodes)
    }

    async fn list_namespaces(&self) -> SourceResult<Listing<core::Namespace>> {
        self.list(EntityKind::Namespace, &self.namespaces)
    }

    async fn list_deployments(&self) -> SourceResult<Listing<apps::Deployment>> {
        self.list(EntityKind::Deployment, &self.deployments)
    }

    async fn list_replica_sets(&self) -> SourceResult<Listing<apps::ReplicaSet>> {
        self.list(EntityKind::ReplicaSet, &self.replica_sets)
    }

    async fn list_pods(&self) -> SourceResult<Listing<core::Pod>> {
        self.list(EntityKind::Pod, &self.pods)
    }

    async fn list_events(&self) -> SourceResult<Listing<core::Event>> {
        self.list(EntityKind::Event, &self.events)
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    pub usage: Mutex<HashMap<String, NodeUsage>>,
    pub samples: Mutex<HashMap<String, Vec<Sample>>>,
    pub down: AtomicBool,
}

impl FakeMetrics {
    pub fn set_usage(&self, node: &str, cpu: &str, memory: &str) {
        self.usage.lock().unwrap().insert(
            node.to_string(),
            NodeUsage {
                cpu: Some(cpu.to_string()),
                memory: Some(memory.to_string()),
            },
        );
    }

    pub fn set_samples(&self, expr: &str, samples: Vec<Sample>) {
        self.samples.lock().unwrap().insert(expr.to_string(), samples);
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn node_usage(&self, node: &str) -> SourceResult<NodeUsage> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Timeout {
                source_name: "prometheus",
            });
        }
        Ok(self.usage.lock().unwrap().get(node).cloned().unwrap_or_default())
    }

    async fn query(&self, expr: &str) -> SourceResult<Vec<Sample>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Timeout {
                source_name: "prometheus",
            });
        }
        Ok(self.samples.lock().unwrap().get(expr).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    /// tier -> image names
    pub images: Mutex<BTreeMap<String, Vec<String>>>,
    /// image name -> tags
    pub tags: Mutex<HashMap<String, Vec<String>>>,
    /// `image:tag` -> labels; a missing entry is a malformed manifest
    pub labels: Mutex<HashMap<String, StringMap>>,
    pub down_tiers: Mutex<HashSet<String>>,
}

#[async_trait]
impl RegistrySource for FakeRegistry {
    fn tiers(&self) -> Vec<String> {
        self.images.lock().unwrap().keys().cloned().collect()
    }

    async fn list_images(&self, tier: &str) -> SourceResult<Vec<String>> {
        if self.down_tiers.lock().unwrap().contains(tier) {
            return Err(unavailable("registry"));
        }
        Ok(self.images.lock().unwrap().get(tier).cloned().unwrap_or_default())
    }

    async fn list_tags(&self, _tier: &str, image: &str) -> SourceResult<Vec<String>> {
        Ok(self.tags.lock().unwrap().get(image).cloned().unwrap_or_default())
    }

    async fn list_labels(&self, _tier: &str, image: &str, tag: &str) -> SourceResult<StringMap> {
        self.labels
            .lock()
            .unwrap()
            .get(&format!("{}:{}", image, tag))
            .cloned()
            .ok_or_else(|| SourceError::malformed("registry", "manifest has no history"))
    }
}

#[derive(Default)]
pub struct FakeProbe {
    pub responses: Mutex<HashMap<String, ProbeResponse>>,
}

#[async_trait]
impl HttpProbe for FakeProbe {
    async fn get(&self, uri: &str, _headers: &BTreeMap<String, String>, _timeout: Duration) -> ProbeResponse {
        self.responses
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_else(ProbeResponse::connection_failed)
    }
}

/// Handles on every fake so tests can change what the next cycle sees
#[derive(Default, Clone)]
pub struct Fakes {
    pub cluster: Arc<FakeCluster>,
    pub metrics: Arc<FakeMetrics>,
    pub registry: Arc<FakeRegistry>,
    pub probe: Arc<FakeProbe>,
}

impl Fakes {
    pub fn sources(&self) -> Sources {
        Sources {
            cluster: self.cluster.clone(),
            metrics: self.metrics.clone(),
            registry: self.registry.clone(),
            probe: self.probe.clone(),
        }
    }

    pub fn context(&self, settings: Settings) -> Context {
        self.context_with_store(settings, Arc::new(Store::in_memory()))
    }

    pub fn context_with_store(&self, settings: Settings, store: Arc<Store>) -> Context {
        Context::new(
            settings,
            store,
            self.sources(),
            HealthRegistry::new(),
            StructuredLogger::new("test"),
        )
    }
}

pub fn node_row(name: &str) -> Node {
    Node {
        name: name.to_string(),
        hostname: None,
        internal_ip: None,
        annotations: StringMap::new(),
        labels: StringMap::new(),
        kernel_version: None,
        kubelet_version: None,
        conditions: vec!["Ready".to_string()],
        cpu_allocatable: 4.0,
        cpu_utilized: 0.0,
        ram_allocatable: 8e9,
        ram_utilized: 0.0,
        cpu_allocation_percent: None,
        ram_allocation_percent: None,
    }
}

pub fn k8s_node(name: &str, cpu_allocatable: &str) -> core::Node {
    from_json(json!({
        "metadata": {"name": name},
        "status": {
            "allocatable": {"cpu": cpu_allocatable, "memory": "8G"},
            "conditions": [{"type": "Ready", "status": "True"}]
        }
    }))
}

pub fn k8s_namespace(uid: &str, name: &str) -> core::Namespace {
    from_json(json!({"metadata": {"uid": uid, "name": name}}))
}

pub fn k8s_deployment(uid: &str, name: &str, namespace: &str, replicas: i32, ready: i32) -> apps::Deployment {
    from_json(json!({
        "metadata": {"uid": uid, "name": name, "namespace": namespace},
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {"app": name}},
            "template": {"spec": {"containers": [{"name": name, "image": format!("container-registry.example.org/team/{}:1.0", name)}]}}
        },
        "status": {"readyReplicas": ready}
    }))
}

pub fn k8s_replica_set(uid: &str, namespace: &str, deployment_uid: &str) -> apps::ReplicaSet {
    from_json(json!({
        "metadata": {
            "uid": uid,
            "name": format!("rs-{}", uid),
            "namespace": namespace,
            "ownerReferences": [{"apiVersion": "apps/v1", "kind": "Deployment", "name": "owner", "uid": deployment_uid}]
        }
    }))
}

pub fn k8s_pod(uid: &str, namespace: &str, replica_set_uid: Option<&str>, phase: &str) -> core::Pod {
    let owners = replica_set_uid
        .map(|rs| json!([{"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs", "uid": rs}]))
        .unwrap_or_else(|| json!([]));
    from_json(json!({
        "metadata": {"uid": uid, "name": format!("pod-{}", uid), "namespace": namespace, "ownerReferences": owners},
        "spec": {
            "nodeName": "node-a",
            "containers": [{
                "name": "app",
                "image": "app:1.0",
                "resources": {"requests": {"cpu": "100m", "memory": "128Mi"}}
            }]
        },
        "status": {"phase": phase}
    }))
}

pub fn k8s_event(uid: &str, namespace: &str) -> core::Event {
    from_json(json!({
        "metadata": {"uid": uid, "name": format!("event-{}", uid), "namespace": namespace},
        "involvedObject": {"kind": "Pod"},
        "reason": "BackOff",
        "message": "Back-off restarting failed container"
    }))
}
