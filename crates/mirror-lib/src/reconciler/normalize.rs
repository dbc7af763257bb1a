//! Conversion of API objects into cached rows
//!
//! Relations to kinds reconciled earlier in the cycle are resolved against
//! the store, so a kind whose source failed contributes its stale rows.

use crate::models::{self, Condition, PodCondition, StringMap};
use crate::quantity::{parse_cpu_opt, parse_ram_opt, RamScale};
use crate::sources::Undecodable;
use crate::store::Store;
use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// An item that could not be normalized; `key` is set when the item's
/// identity was still readable
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    pub key: Option<String>,
    pub reason: String,
}

impl Malformed {
    fn new(key: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            key: key.map(str::to_string),
            reason: reason.into(),
        }
    }
}

impl From<Undecodable> for Malformed {
    fn from(item: Undecodable) -> Self {
        Self {
            key: item.key,
            reason: item.reason,
        }
    }
}

pub type Normalized<T> = Result<T, Malformed>;

fn map_or_empty(map: &Option<BTreeMap<String, String>>) -> StringMap {
    map.clone().unwrap_or_default()
}

fn quantity<'a>(map: &'a Option<BTreeMap<String, Quantity>>, name: &str) -> Option<&'a str> {
    map.as_ref()
        .and_then(|m| m.get(name))
        .map(|q| q.0.as_str())
}

fn controller_of<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == kind)
}

fn namespace_uid(store: &Store, namespace: Option<&str>) -> Option<String> {
    namespace
        .and_then(|name| store.namespace_by_name(name))
        .map(|ns| ns.uid)
}

/// Raw usage of a node, when the metrics backend answered
#[derive(Debug, Clone, Default)]
pub struct NodeFigures {
    pub cpu_used: Option<String>,
    pub ram_used: Option<String>,
    pub cpu_allocation_percent: Option<f64>,
    pub ram_allocation_percent: Option<f64>,
}

pub fn node(raw: &core::Node, figures: &NodeFigures, precision: u32) -> Normalized<models::Node> {
    let name = raw
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Malformed::new(None, "node has no name"))?;
    let status = raw.status.clone().unwrap_or_default();
    let bad = |e: crate::error::QuantityError| Malformed::new(Some(name), e.to_string());

    let address = |kind: &str| {
        status
            .addresses
            .as_ref()
            .and_then(|a| a.iter().find(|addr| addr.type_ == kind))
            .map(|addr| addr.address.clone())
    };

    let conditions = status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .filter(|c| c.status == "True")
                .map(|c| c.type_.clone())
                .collect()
        })
        .unwrap_or_default();

    Ok(models::Node {
        name: name.to_string(),
        hostname: address("Hostname"),
        internal_ip: address("InternalIP"),
        annotations: map_or_empty(&raw.metadata.annotations),
        labels: map_or_empty(&raw.metadata.labels),
        kernel_version: status.node_info.as_ref().map(|i| i.kernel_version.clone()),
        kubelet_version: status.node_info.as_ref().map(|i| i.kubelet_version.clone()),
        conditions,
        cpu_allocatable: parse_cpu_opt(quantity(&status.allocatable, "cpu"), precision).map_err(bad)?,
        cpu_utilized: parse_cpu_opt(figures.cpu_used.as_deref(), precision).map_err(bad)?,
        ram_allocatable: parse_ram_opt(quantity(&status.allocatable, "memory"), RamScale::Decimal)
            .map_err(bad)?,
        ram_utilized: parse_ram_opt(figures.ram_used.as_deref(), RamScale::Decimal).map_err(bad)?,
        cpu_allocation_percent: figures.cpu_allocation_percent,
        ram_allocation_percent: figures.ram_allocation_percent,
    })
}

pub fn namespace(raw: &core::Namespace) -> Normalized<models::Namespace> {
    let uid = raw.metadata.uid.as_deref();
    let name = raw
        .metadata
        .name
        .clone()
        .ok_or_else(|| Malformed::new(uid, "namespace has no name"))?;
    let uid = uid.ok_or_else(|| Malformed::new(None, format!("namespace {} has no uid", name)))?;

    Ok(models::Namespace::new(
        uid.to_string(),
        name,
        map_or_empty(&raw.metadata.annotations),
        map_or_empty(&raw.metadata.labels),
    ))
}

pub fn deployment(raw: &apps::Deployment, store: &Store) -> Normalized<models::Deployment> {
    let meta = &raw.metadata;
    let uid = meta
        .uid
        .as_deref()
        .ok_or_else(|| Malformed::new(None, "deployment has no uid"))?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Malformed::new(Some(uid), "deployment has no name"))?;
    let namespace = meta.namespace.clone().unwrap_or_default();

    let spec = raw.spec.as_ref();
    let status = raw.status.as_ref();

    let images = spec
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| pod.containers.iter().filter_map(|c| c.image.clone()).collect())
        .unwrap_or_default();

    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| Condition {
                    kind: c.type_.clone(),
                    status: c.status == "True",
                    message: c.message.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(models::Deployment {
        uid: uid.to_string(),
        name,
        namespace_uid: namespace_uid(store, Some(&namespace)),
        namespace,
        annotations: map_or_empty(&meta.annotations),
        labels: map_or_empty(&meta.labels),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        images,
        conditions,
    })
}

pub fn replica_set(raw: &apps::ReplicaSet, store: &Store) -> Normalized<models::ReplicaSet> {
    let meta = &raw.metadata;
    let uid = meta
        .uid
        .as_deref()
        .ok_or_else(|| Malformed::new(None, "replica set has no uid"))?;

    Ok(models::ReplicaSet {
        uid: uid.to_string(),
        name: meta.name.clone().unwrap_or_default(),
        namespace_uid: namespace_uid(store, meta.namespace.as_deref()),
        deployment_uid: controller_of(meta, "Deployment").map(|o| o.uid.clone()),
    })
}

fn pod_condition(status: Option<&core::PodStatus>, kind: &str) -> Option<PodCondition> {
    status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == kind))
        .map(|c| PodCondition {
            status: c.status == "True",
            last_transition: c.last_transition_time.as_ref().map(|t| t.0),
            message: c.message.clone(),
        })
}

/// A pod resolves to a deployment through its owning replica set
pub fn pod(raw: &core::Pod, store: &Store) -> Normalized<models::Pod> {
    let meta = &raw.metadata;
    let uid = meta
        .uid
        .as_deref()
        .ok_or_else(|| Malformed::new(None, "pod has no uid"))?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Malformed::new(Some(uid), "pod has no name"))?;

    let deployment_uid = controller_of(meta, "ReplicaSet")
        .and_then(|owner| store.replica_sets().find_one(&owner.uid))
        .and_then(|rs| rs.deployment_uid)
        .filter(|uid| store.deployments().contains(uid));

    let status = raw.status.as_ref();
    let statuses = status
        .and_then(|s| s.container_statuses.as_ref())
        .cloned()
        .unwrap_or_default();
    let total = raw.spec.as_ref().map(|s| s.containers.len()).unwrap_or(statuses.len());
    let ready = statuses.iter().filter(|s| s.ready).count();

    Ok(models::Pod {
        uid: uid.to_string(),
        name,
        created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
        namespace_uid: namespace_uid(store, meta.namespace.as_deref()),
        namespace: meta.namespace.clone().unwrap_or_default(),
        orphan: deployment_uid.is_none(),
        deployment_uid,
        node_name: raw.spec.as_ref().and_then(|s| s.node_name.clone()),
        annotations: map_or_empty(&meta.annotations),
        labels: map_or_empty(&meta.labels),
        state: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        scheduled: pod_condition(status, "PodScheduled"),
        initialized: pod_condition(status, "Initialized"),
        ready: pod_condition(status, "Ready"),
        containers_ready: pod_condition(status, "ContainersReady"),
        restarts: statuses.iter().map(|s| s.restart_count).sum(),
        ready_count: format!("{}/{}", ready, total),
    })
}

/// Containers of a pod; requests and limits use the binary scale
pub fn containers(raw: &core::Pod, pod_uid: &str, precision: u32) -> Vec<Normalized<models::Container>> {
    let Some(spec) = raw.spec.as_ref() else {
        return Vec::new();
    };

    spec.containers
        .iter()
        .map(|c| {
            let key = format!("{}/{}", pod_uid, c.name);
            let bad = |e: crate::error::QuantityError| Malformed::new(Some(key.as_str()), e.to_string());
            let resources = c.resources.clone().unwrap_or_default();

            Ok(models::Container {
                pod_uid: pod_uid.to_string(),
                name: c.name.clone(),
                image: c.image.clone().unwrap_or_default(),
                liveness_probe: c
                    .liveness_probe
                    .as_ref()
                    .and_then(|p| serde_json::to_value(p).ok()),
                readiness_probe: c
                    .readiness_probe
                    .as_ref()
                    .and_then(|p| serde_json::to_value(p).ok()),
                cpu_requests: parse_cpu_opt(quantity(&resources.requests, "cpu"), precision).map_err(bad)?,
                cpu_limits: parse_cpu_opt(quantity(&resources.limits, "cpu"), precision).map_err(bad)?,
                ram_requests: parse_ram_opt(quantity(&resources.requests, "memory"), RamScale::Binary)
                    .map_err(bad)?,
                ram_limits: parse_ram_opt(quantity(&resources.limits, "memory"), RamScale::Binary)
                    .map_err(bad)?,
            })
        })
        .collect()
}

pub fn event(raw: &core::Event, store: &Store) -> Normalized<models::Event> {
    let meta = &raw.metadata;
    let uid = meta
        .uid
        .as_deref()
        .ok_or_else(|| Malformed::new(None, "event has no uid"))?;

    Ok(models::Event {
        uid: uid.to_string(),
        namespace_uid: namespace_uid(store, meta.namespace.as_deref()),
        name: meta.name.clone().unwrap_or_default(),
        kind: raw.involved_object.kind.clone(),
        last_timestamp: raw.last_timestamp.as_ref().map(|t| t.0),
        message: raw.message.clone(),
        reason: raw.reason.clone(),
    })
}
