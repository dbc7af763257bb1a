//! Cluster kinds: nodes through events

use super::normalize::{self, Malformed, NodeFigures};
use super::{KindOutcome, Sweep};
use crate::context::Context;
use crate::models::{EntityKind, Node};
use crate::sources::{single_value, SourceResult};
use tracing::{debug, warn};

/// Percent of a node's allocatable CPU that pods have requested
pub fn cpu_saturation_query(node: &str) -> String {
    format!(
        r#"sum(kube_pod_container_resource_requests_cpu_cores{{node="{0}"}})/sum(kube_node_status_allocatable_cpu_cores{{node="{0}"}})"#,
        node
    )
}

/// Percent of a node's allocatable memory that pods have requested
pub fn ram_saturation_query(node: &str) -> String {
    format!(
        r#"sum(kube_pod_container_resource_requests_memory_bytes{{node="{0}"}})/sum(kube_node_status_allocatable_memory_bytes{{node="{0}"}})"#,
        node
    )
}

/// Usage and saturation of one node, with which lookups succeeded
struct Figures {
    values: NodeFigures,
    usage_ok: bool,
    saturation_ok: bool,
    warnings: Vec<String>,
}

/// Failed lookups are reported as warnings and left empty so the caller
/// can fall back to cached figures.
async fn node_figures(ctx: &Context, name: &str) -> Figures {
    let metrics = ctx.sources.metrics.as_ref();
    let mut figures = Figures {
        values: NodeFigures::default(),
        usage_ok: true,
        saturation_ok: true,
        warnings: Vec::new(),
    };

    match metrics.node_usage(name).await {
        Ok(usage) => {
            figures.values.cpu_used = usage.cpu;
            figures.values.ram_used = usage.memory;
        }
        Err(e) => {
            figures.usage_ok = false;
            figures.warnings.push(format!("node {} usage: {}", name, e));
        }
    }

    match single_value(metrics, &cpu_saturation_query(name)).await {
        Ok(value) => figures.values.cpu_allocation_percent = value.map(|v| v * 100.0),
        Err(e) => {
            figures.saturation_ok = false;
            figures.warnings.push(format!("node {} cpu saturation: {}", name, e));
        }
    }
    match single_value(metrics, &ram_saturation_query(name)).await {
        Ok(value) => figures.values.ram_allocation_percent = value.map(|v| v * 100.0),
        Err(e) => {
            figures.saturation_ok = false;
            figures.warnings.push(format!("node {} ram saturation: {}", name, e));
        }
    }

    figures
}

pub async fn reconcile_nodes(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_nodes().await?;
    let store = &ctx.store;
    let mut sweep = Sweep::over(store.nodes(), EntityKind::Node, &raw);

    for item in &raw.items {
        let Some(name) = item.metadata.name.as_deref() else {
            sweep.malformed(Malformed {
                key: None,
                reason: "node has no name".to_string(),
            });
            continue;
        };

        let figures = node_figures(ctx, name).await;
        for warning in &figures.warnings {
            warn!(node = name, warning = %warning, "Node metrics lookup failed");
            sweep.warn(warning.clone());
        }

        let row = normalize::node(item, &figures.values, ctx.settings.precision).map(|node| {
            with_cached_figures(
                node,
                store.nodes().find_one(name),
                figures.usage_ok,
                figures.saturation_ok,
            )
        });
        sweep.apply(row);
    }

    Ok(sweep.finish())
}

/// Carry forward the cached figures a failed lookup could not refresh
fn with_cached_figures(mut node: Node, cached: Option<Node>, usage_ok: bool, saturation_ok: bool) -> Node {
    let Some(cached) = cached else {
        return node;
    };
    if !usage_ok {
        node.cpu_utilized = cached.cpu_utilized;
        node.ram_utilized = cached.ram_utilized;
    }
    if !saturation_ok {
        node.cpu_allocation_percent = node.cpu_allocation_percent.or(cached.cpu_allocation_percent);
        node.ram_allocation_percent = node.ram_allocation_percent.or(cached.ram_allocation_percent);
    }
    node
}

pub async fn reconcile_namespaces(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_namespaces().await?;
    let mut sweep = Sweep::over(ctx.store.namespaces(), EntityKind::Namespace, &raw);
    for item in &raw.items {
        sweep.apply(normalize::namespace(item));
    }
    Ok(sweep.finish())
}

pub async fn reconcile_deployments(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_deployments().await?;
    let store = &ctx.store;
    let mut sweep = Sweep::over(store.deployments(), EntityKind::Deployment, &raw);
    for item in &raw.items {
        sweep.apply(normalize::deployment(item, store));
    }
    Ok(sweep.finish())
}

pub async fn reconcile_replica_sets(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_replica_sets().await?;
    let store = &ctx.store;
    let mut sweep = Sweep::over(store.replica_sets(), EntityKind::ReplicaSet, &raw);
    for item in &raw.items {
        sweep.apply(normalize::replica_set(item, store));
    }
    Ok(sweep.finish())
}

/// Pods and their containers. Containers are upserted per pod and only
/// removed together with their pod.
pub async fn reconcile_pods(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_pods().await?;
    let store = &ctx.store;
    let mut sweep = Sweep::over(store.pods(), EntityKind::Pod, &raw);
    let mut containers = KindOutcome::new(EntityKind::Container, 0);

    for item in &raw.items {
        let pod = match normalize::pod(item, store) {
            Ok(pod) => pod,
            Err(malformed) => {
                sweep.malformed(malformed);
                continue;
            }
        };

        for container in normalize::containers(item, &pod.uid, ctx.settings.precision) {
            containers.fetched += 1;
            match container {
                Ok(container) => containers.record(store.containers().upsert(container)),
                Err(malformed) => {
                    warn!(key = ?malformed.key, reason = %malformed.reason, "Skipping malformed container");
                    containers.skipped += 1;
                }
            }
        }
        sweep.upsert(pod);
    }

    let mut outcome = sweep.finish_with(|uid| store.delete_pod(uid).is_some());
    debug!(
        containers = containers.fetched,
        upserted = containers.upserted(),
        unchanged = containers.unchanged,
        "Containers reconciled"
    );
    outcome.absorb(containers);
    Ok(outcome)
}

pub async fn reconcile_events(ctx: &Context) -> SourceResult<KindOutcome> {
    let raw = ctx.sources.cluster.list_events().await?;
    let store = &ctx.store;
    let mut sweep = Sweep::over(store.events(), EntityKind::Event, &raw);
    for item in &raw.items {
        sweep.apply(normalize::event(item, store));
    }
    Ok(sweep.finish())
}
