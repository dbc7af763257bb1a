//! Cached entity models
//!
//! Every row is replaced wholesale on each reconciliation cycle. Relations
//! are plain foreign-key fields resolved through store lookups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::quantity::percent_of;

pub type StringMap = BTreeMap<String, String>;

/// Host prefix identifying images pulled from the local registry
pub const LOCAL_REGISTRY_PREFIX: &str = "container-registry";

/// Environments recognised in `<app>-<env>` namespace names
pub const NAMESPACE_ENVS: &[&str] = &["prod", "prodtest", "preprod", "perf", "cola"];

/// Entity kinds held in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Namespace,
    Deployment,
    ReplicaSet,
    Pod,
    Container,
    Event,
    HealthCheck,
    DockerImage,
    DockerTag,
    Report,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Namespace => "namespace",
            EntityKind::Deployment => "deployment",
            EntityKind::ReplicaSet => "replica_set",
            EntityKind::Pod => "pod",
            EntityKind::Container => "container",
            EntityKind::Event => "event",
            EntityKind::HealthCheck => "health_check",
            EntityKind::DockerImage => "docker_image",
            EntityKind::DockerTag => "docker_tag",
            EntityKind::Report => "report",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status condition as reported by the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: String,
    pub status: bool,
    pub message: Option<String>,
}

/// Cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub hostname: Option<String>,
    pub internal_ip: Option<String>,
    pub annotations: StringMap,
    pub labels: StringMap,
    pub kernel_version: Option<String>,
    pub kubelet_version: Option<String>,
    /// Names of conditions currently `True`
    pub conditions: Vec<String>,
    /// Cores
    pub cpu_allocatable: f64,
    pub cpu_utilized: f64,
    /// Bytes, decimal scale
    pub ram_allocatable: f64,
    pub ram_utilized: f64,
    /// Requested/allocatable from the metrics backend, when it answered
    pub cpu_allocation_percent: Option<f64>,
    pub ram_allocation_percent: Option<f64>,
}

impl Node {
    pub fn cpu_utilization_percent(&self) -> f64 {
        percent_of(self.cpu_utilized, self.cpu_allocatable)
    }

    pub fn ram_utilization_percent(&self) -> f64 {
        percent_of(self.ram_utilized, self.ram_allocatable)
    }

    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.iter().any(|c| c == name)
    }
}

/// Cluster namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub uid: String,
    pub name: String,
    pub annotations: StringMap,
    pub labels: StringMap,
    /// Derived from `<app>-<env>` names
    pub app: Option<String>,
    pub env: Option<String>,
}

impl Namespace {
    pub fn new(uid: String, name: String, annotations: StringMap, labels: StringMap) -> Self {
        let (app, env) = match split_app_env(&name) {
            Some((app, env)) => (Some(app), Some(env)),
            None => (None, None),
        };
        Self {
            uid,
            name,
            annotations,
            labels,
            app,
            env,
        }
    }
}

/// Split `<app>-<env>` into its parts when env is a known environment
pub fn split_app_env(name: &str) -> Option<(String, String)> {
    let (app, env) = name.rsplit_once('-')?;
    let valid_app = !app.is_empty()
        && app
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid_app && NAMESPACE_ENVS.contains(&env) {
        Some((app.to_string(), env.to_string()))
    } else {
        None
    }
}

/// Cluster deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub uid: String,
    pub name: String,
    pub namespace_uid: Option<String>,
    pub namespace: String,
    pub annotations: StringMap,
    pub labels: StringMap,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub images: Vec<String>,
    pub conditions: Vec<Condition>,
}

impl Deployment {
    /// First local-registry image, else the first image, without its path
    pub fn primary_image(&self) -> Option<String> {
        let primary = self
            .images
            .iter()
            .find(|img| img.starts_with(LOCAL_REGISTRY_PREFIX))
            .or_else(|| self.images.first())?;
        primary.rsplit('/').next().map(str::to_string)
    }

    /// Primary image split into `(image, tag)`
    pub fn image_and_tag(&self) -> Option<(String, Option<String>)> {
        let image = self.primary_image()?;
        match image.split_once(':') {
            Some((name, tag)) => Some((name.to_string(), Some(tag.to_string()))),
            None => Some((image, None)),
        }
    }
}

/// Cluster replica set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub uid: String,
    pub name: String,
    pub namespace_uid: Option<String>,
    /// Owning deployment uid from owner references
    pub deployment_uid: Option<String>,
}

/// Boolean condition with its transition time and message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodCondition {
    pub status: bool,
    pub last_transition: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Cluster pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub namespace_uid: Option<String>,
    pub namespace: String,
    pub deployment_uid: Option<String>,
    pub node_name: Option<String>,
    pub annotations: StringMap,
    pub labels: StringMap,
    /// Lifecycle phase
    pub state: String,
    /// `None` when the API reported no such condition
    #[serde(default)]
    pub scheduled: Option<PodCondition>,
    #[serde(default)]
    pub initialized: Option<PodCondition>,
    #[serde(default)]
    pub ready: Option<PodCondition>,
    #[serde(default)]
    pub containers_ready: Option<PodCondition>,
    pub restarts: i32,
    /// `"ready/total"`
    pub ready_count: String,
    /// No owning deployment resolved this cycle
    pub orphan: bool,
}

impl Pod {
    pub fn healthy(&self) -> bool {
        matches!(self.state.as_str(), "Running" | "Succeeded")
    }
}

/// Container inside a pod, keyed by `(pod, name)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub pod_uid: String,
    pub name: String,
    pub image: String,
    pub liveness_probe: Option<serde_json::Value>,
    pub readiness_probe: Option<serde_json::Value>,
    pub cpu_requests: f64,
    pub cpu_limits: f64,
    pub ram_requests: f64,
    pub ram_limits: f64,
}

/// A container resource figure that can be summed across pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    CpuRequests,
    CpuLimits,
    RamRequests,
    RamLimits,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::CpuRequests,
        Resource::CpuLimits,
        Resource::RamRequests,
        Resource::RamLimits,
    ];

    pub fn of(&self, container: &Container) -> f64 {
        match self {
            Resource::CpuRequests => container.cpu_requests,
            Resource::CpuLimits => container.cpu_limits,
            Resource::RamRequests => container.ram_requests,
            Resource::RamLimits => container.ram_limits,
        }
    }

    pub fn sum<'a>(&self, containers: impl IntoIterator<Item = &'a Container>) -> f64 {
        containers.into_iter().map(|c| self.of(c)).sum()
    }
}

/// Requests and limits summed over a set of containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTotals {
    /// Cores
    pub cpu_requests: f64,
    pub cpu_limits: f64,
    /// Bytes, binary scale
    pub ram_requests: f64,
    pub ram_limits: f64,
}

impl ResourceTotals {
    pub fn of(containers: &[Container]) -> Self {
        Self {
            cpu_requests: Resource::CpuRequests.sum(containers),
            cpu_limits: Resource::CpuLimits.sum(containers),
            ram_requests: Resource::RamRequests.sum(containers),
            ram_limits: Resource::RamLimits.sum(containers),
        }
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::CpuRequests => self.cpu_requests,
            Resource::CpuLimits => self.cpu_limits,
            Resource::RamRequests => self.ram_requests,
            Resource::RamLimits => self.ram_limits,
        }
    }
}

/// Cluster event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,
    pub namespace_uid: Option<String>,
    pub name: String,
    pub kind: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub reason: Option<String>,
}

/// Outcome of one configured HTTP health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub uri: String,
    pub result: String,
    pub details: Option<String>,
    /// `None` when the check has no pass/fail criterion
    pub healthy: Option<bool>,
}

/// Image in a registry tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerImage {
    pub repo: String,
    pub name: String,
}

impl DockerImage {
    pub fn reference(&self) -> String {
        format!("{}/{}", self.repo, self.name)
    }
}

/// Tag of an image, with the labels baked into its manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerTag {
    /// [`DockerImage::reference`] of the owning image
    pub image: String,
    pub name: String,
    pub labels: StringMap,
}

/// Node figures copied into a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub conditions: Vec<String>,
    pub cpu_allocation_percent: Option<f64>,
    pub ram_allocation_percent: Option<f64>,
    pub cpu_utilization_percent: f64,
    pub ram_utilization_percent: f64,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            conditions: node.conditions.clone(),
            cpu_allocation_percent: node.cpu_allocation_percent,
            ram_allocation_percent: node.ram_allocation_percent,
            cpu_utilization_percent: node.cpu_utilization_percent(),
            ram_utilization_percent: node.ram_utilization_percent(),
        }
    }
}

/// Pod restarted within the rolling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restart {
    pub namespace: Option<String>,
    pub pod: String,
    pub count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhealthyPod {
    pub namespace: String,
    pub pod: String,
    pub state: String,
}

/// Immutable-once-complete snapshot of derived health data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Unix seconds; id and sort key
    pub timestamp: i64,
    pub complete: bool,
    pub nodes: Vec<NodeSnapshot>,
    pub restarts: Vec<Restart>,
    pub unhealthy_pods: Vec<UnhealthyPod>,
    pub health_checks: Vec<HealthCheck>,
    /// Warnings recorded while the report was built
    pub errors: Vec<String>,
}

impl Report {
    pub fn pending(timestamp: i64) -> Self {
        Self {
            timestamp,
            complete: false,
            nodes: Vec::new(),
            restarts: Vec::new(),
            unhealthy_pods: Vec::new(),
            health_checks: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn title(&self) -> String {
        let when = DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .map(|t| t.format("%B %e, %Y %l:%M%P").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        format!("Health Report - {}", when)
    }
}
