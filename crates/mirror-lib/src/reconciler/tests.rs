use super::*;
use crate::config::{CheckDefinition, CheckSpec, Settings};
use crate::health::ComponentStatus;
use crate::models::StringMap;
use crate::sources::{ProbeResponse, Sample};
use crate::store::idx;
use crate::testing::*;
use std::collections::{BTreeMap, HashMap};

fn seed_workload(fakes: &Fakes) {
    *fakes.cluster.namespaces.lock().unwrap() = vec![
        k8s_namespace("ns-1", "shop-prod"),
        k8s_namespace("ns-2", "shop-preprod"),
    ];
    *fakes.cluster.deployments.lock().unwrap() = vec![k8s_deployment("d-1", "web", "shop-prod", 2, 2)];
    *fakes.cluster.replica_sets.lock().unwrap() = vec![k8s_replica_set("rs-1", "shop-prod", "d-1")];
    *fakes.cluster.pods.lock().unwrap() = vec![
        k8s_pod("p-1", "shop-prod", Some("rs-1"), "Running"),
        k8s_pod("p-2", "shop-prod", None, "Running"),
    ];
    *fakes.cluster.events.lock().unwrap() = vec![k8s_event("e-1", "shop-prod")];
}

#[tokio::test]
async fn test_first_cycle_populates_every_kind() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    *fakes.cluster.nodes.lock().unwrap() = vec![k8s_node("node-a", "4")];
    let ctx = fakes.context(Settings::default());

    let summary = Reconciler::default().run_cycle(&ctx).await.unwrap();

    assert!(summary.failures.is_empty());
    assert!(!summary.interrupted);
    assert_eq!(ctx.store.nodes().len(), 1);
    assert_eq!(ctx.store.namespaces().len(), 2);
    assert_eq!(ctx.store.pods().len(), 2);
    assert_eq!(ctx.store.containers().len(), 2);
    assert_eq!(ctx.store.events().len(), 1);

    let event = ctx.store.events().find_one("e-1").unwrap();
    assert_eq!(event.namespace_uid.as_deref(), Some("ns-1"));
    assert_eq!(summary.outcome(EntityKind::Pod).unwrap().inserted, 4);
    assert!(ctx.health.last_cycle().await.is_some());
}

#[tokio::test]
async fn test_unobserved_rows_are_deleted() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.cluster.namespaces.lock().unwrap().retain(|ns| ns.metadata.name.as_deref() == Some("shop-prod"));
    fakes.cluster.pods.lock().unwrap().retain(|p| p.metadata.uid.as_deref() == Some("p-1"));
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert_eq!(summary.outcome(EntityKind::Namespace).unwrap().deleted, 1);
    assert!(ctx.store.namespace_by_name("shop-preprod").is_none());
    assert!(!ctx.store.pods().contains("p-2"));
    assert!(ctx.store.pod_containers("p-2").is_empty());
    assert_eq!(ctx.store.pod_containers("p-1").len(), 1);
}

#[tokio::test]
async fn test_unchanged_rows_are_not_rewritten() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    let summary = reconciler.run_cycle(&ctx).await.unwrap();
    let namespaces = summary.outcome(EntityKind::Namespace).unwrap();
    assert_eq!(namespaces.unchanged, 2);
    assert_eq!(namespaces.upserted(), 0);
    assert_eq!(namespaces.deleted, 0);
}

#[tokio::test]
async fn test_orphan_flag_follows_owner_chain() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    let owned = ctx.store.pods().find_one("p-1").unwrap();
    assert_eq!(owned.deployment_uid.as_deref(), Some("d-1"));
    assert!(!owned.orphan);
    assert!(ctx.store.pods().find_one("p-2").unwrap().orphan);

    // The deployment disappears; its pod becomes an orphan on the next cycle
    fakes.cluster.deployments.lock().unwrap().clear();
    reconciler.run_cycle(&ctx).await.unwrap();

    let pod = ctx.store.pods().find_one("p-1").unwrap();
    assert!(pod.orphan);
    assert_eq!(pod.deployment_uid, None);
}

#[tokio::test]
async fn test_node_utilization_from_usage() {
    let fakes = Fakes::default();
    *fakes.cluster.nodes.lock().unwrap() = vec![
        k8s_node("node-a", "4"),
        k8s_node("node-b", "2"),
        k8s_node("node-c", "0"),
    ];
    fakes.metrics.set_usage("node-a", "2", "1G");
    fakes.metrics.set_usage("node-b", "3", "1G");
    fakes.metrics.set_samples(
        &cluster::cpu_saturation_query("node-a"),
        vec![Sample {
            labels: StringMap::new(),
            value: 0.25,
        }],
    );
    let ctx = fakes.context(Settings::default());

    Reconciler::default().run_cycle(&ctx).await.unwrap();

    let a = ctx.store.nodes().find_one("node-a").unwrap();
    assert_eq!(a.cpu_utilization_percent(), 50.0);
    assert_eq!(a.cpu_allocation_percent, Some(25.0));
    assert_eq!(a.ram_allocation_percent, None);
    assert_eq!(ctx.store.nodes().find_one("node-b").unwrap().cpu_utilization_percent(), 150.0);
    assert_eq!(ctx.store.nodes().find_one("node-c").unwrap().cpu_utilization_percent(), 0.0);
}

#[tokio::test]
async fn test_metrics_outage_keeps_cached_figures() {
    let fakes = Fakes::default();
    *fakes.cluster.nodes.lock().unwrap() = vec![k8s_node("node-a", "4")];
    fakes.metrics.set_usage("node-a", "2", "1G");
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.metrics.down.store(true, Ordering::SeqCst);
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert!(summary.failures.is_empty());
    assert_eq!(summary.outcome(EntityKind::Node).unwrap().warnings.len(), 3);
    assert_eq!(ctx.store.nodes().find_one("node-a").unwrap().cpu_utilized, 2.0);

    let health = ctx.health.health().await;
    assert_eq!(health.components["metrics"].status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn test_failed_kind_keeps_cached_rows() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.cluster.fail(EntityKind::Pod);
    fakes.cluster.pods.lock().unwrap().clear();
    fakes.cluster.events.lock().unwrap().clear();
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert_eq!(summary.failed_kinds(), vec![EntityKind::Pod]);
    assert_eq!(ctx.store.pods().len(), 2);
    assert_eq!(ctx.store.containers().len(), 2);
    // Later kinds still ran
    assert_eq!(ctx.store.events().len(), 0);

    let health = ctx.health.health().await;
    assert_eq!(health.components["cluster"].status, ComponentStatus::Degraded);

    fakes.cluster.recover();
    reconciler.run_cycle(&ctx).await.unwrap();
    assert_eq!(ctx.store.pods().len(), 0);
}

#[tokio::test]
async fn test_pods_resolve_through_stale_replica_sets() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.cluster.fail(EntityKind::ReplicaSet);
    fakes.cluster.pods.lock().unwrap().push(k8s_pod("p-3", "shop-prod", Some("rs-1"), "Pending"));
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert!(summary.failed(EntityKind::ReplicaSet));
    let pod = ctx.store.pods().find_one("p-3").unwrap();
    assert_eq!(pod.deployment_uid.as_deref(), Some("d-1"));
    assert!(!pod.orphan);
}

#[tokio::test]
async fn test_every_cluster_kind_failing_marks_cluster_unhealthy() {
    let fakes = Fakes::default();
    for kind in &CYCLE_ORDER[..6] {
        fakes.cluster.fail(*kind);
    }
    let ctx = fakes.context(Settings::default());

    let summary = Reconciler::default().run_cycle(&ctx).await.unwrap();

    assert_eq!(summary.failures.len(), 6);
    let health = ctx.health.health().await;
    assert_eq!(health.components["cluster"].status, ComponentStatus::Unhealthy);
    assert_eq!(health.components["checks"].status, ComponentStatus::Healthy);
}

#[tokio::test]
async fn test_malformed_item_keeps_previous_row() {
    let fakes = Fakes::default();
    *fakes.cluster.nodes.lock().unwrap() = vec![k8s_node("node-a", "4"), k8s_node("node-b", "2")];
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    *fakes.cluster.nodes.lock().unwrap() = vec![k8s_node("node-a", "lots"), k8s_node("node-b", "8")];
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    let nodes = summary.outcome(EntityKind::Node).unwrap();
    assert_eq!(nodes.skipped, 1);
    assert_eq!(nodes.updated, 1);
    assert_eq!(nodes.deleted, 0);
    assert_eq!(ctx.store.nodes().find_one("node-a").unwrap().cpu_allocatable, 4.0);
    assert_eq!(ctx.store.nodes().find_one("node-b").unwrap().cpu_allocatable, 8.0);
}

#[tokio::test]
async fn test_undecodable_items_are_skipped_not_the_whole_kind() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.cluster.pods.lock().unwrap().retain(|p| p.metadata.uid.as_deref() == Some("p-1"));
    fakes.cluster.garble(EntityKind::Pod, Some("p-2"));
    fakes.cluster.garble(EntityKind::Pod, None);
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert!(!summary.failed(EntityKind::Pod));
    let pods = summary.outcome(EntityKind::Pod).unwrap();
    assert_eq!(pods.fetched, 3);
    assert_eq!(pods.skipped, 2);
    assert_eq!(pods.deleted, 0);
    assert!(ctx.store.pods().contains("p-1"));
    assert!(ctx.store.pods().contains("p-2"));
    assert_eq!(ctx.store.containers().len(), 2);
}

#[tokio::test]
async fn test_health_checks_probed_and_swept() {
    let fakes = Fakes::default();
    fakes.probe.responses.lock().unwrap().insert(
        "https://billing.example.org/status".to_string(),
        ProbeResponse {
            code: 404,
            message: "Not Found".to_string(),
            body: String::new(),
        },
    );

    let mut settings = Settings::default();
    settings.checks.insert(
        "billing".to_string(),
        CheckDefinition::Full(CheckSpec {
            uri: "https://billing.example.org/status".to_string(),
            response_codes: BTreeMap::from([("404".to_string(), "Not deployed here".to_string())]),
            ..CheckSpec::default()
        }),
    );
    settings.checks.insert(
        "search".to_string(),
        CheckDefinition::Uri("https://search.example.org/".to_string()),
    );
    let mut ctx = fakes.context(settings.clone());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    let billing = ctx.store.health_checks().find_one("billing").unwrap();
    assert_eq!(billing.result, "404 Not deployed here");
    assert_eq!(billing.healthy, Some(true));

    let search = ctx.store.health_checks().find_one("search").unwrap();
    assert_eq!(search.result, "400 CONNECTION FAILED");
    assert_eq!(search.healthy, Some(false));

    settings.checks.remove("search");
    ctx.reload(settings, fakes.sources());
    let summary = reconciler.run_cycle(&ctx).await.unwrap();
    assert_eq!(summary.outcome(EntityKind::HealthCheck).unwrap().deleted, 1);
    assert!(!ctx.store.health_checks().contains("search"));
}

fn seed_registry(fakes: &Fakes) {
    *fakes.registry.images.lock().unwrap() = BTreeMap::from([
        ("dev".to_string(), vec!["shop/web".to_string()]),
        ("prod".to_string(), vec!["shop/web".to_string(), "shop/api".to_string()]),
    ]);
    *fakes.registry.tags.lock().unwrap() = HashMap::from([
        ("shop/web".to_string(), vec!["1.0".to_string(), "1.1".to_string()]),
        ("shop/api".to_string(), vec!["2.0".to_string()]),
    ]);
    let labels = StringMap::from([("git-commit".to_string(), "abc123".to_string())]);
    *fakes.registry.labels.lock().unwrap() = HashMap::from([
        ("shop/web:1.0".to_string(), labels.clone()),
        ("shop/web:1.1".to_string(), labels.clone()),
        ("shop/api:2.0".to_string(), labels),
    ]);
}

#[tokio::test]
async fn test_registry_images_and_tags() {
    let fakes = Fakes::default();
    seed_registry(&fakes);
    let ctx = fakes.context(Settings::default());

    let summary = Reconciler::default().run_cycle(&ctx).await.unwrap();

    assert!(!summary.failed(EntityKind::DockerImage));
    assert_eq!(ctx.store.docker_images().len(), 3);
    assert_eq!(ctx.store.docker_tags().len(), 5);
    let tag = ctx.store.docker_tags().find_one("prod/shop/api:2.0").unwrap();
    assert_eq!(tag.labels.get("git-commit").map(String::as_str), Some("abc123"));
}

#[tokio::test]
async fn test_registry_tier_outage_keeps_its_images() {
    let fakes = Fakes::default();
    seed_registry(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes.registry.down_tiers.lock().unwrap().insert("prod".to_string());
    fakes.registry.labels.lock().unwrap().remove("shop/web:1.1");
    let summary = reconciler.run_cycle(&ctx).await.unwrap();

    assert!(!summary.failed(EntityKind::DockerImage));
    let outcome = summary.outcome(EntityKind::DockerImage).unwrap();
    assert_eq!(outcome.deleted, 0);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(ctx.store.docker_images().len(), 3);
    assert_eq!(ctx.store.docker_tags().len(), 5);

    fakes.registry.down_tiers.lock().unwrap().insert("dev".to_string());
    let summary = reconciler.run_cycle(&ctx).await.unwrap();
    assert!(summary.failed(EntityKind::DockerImage));
    assert_eq!(ctx.store.docker_images().len(), 3);
}

#[tokio::test]
async fn test_removed_image_takes_its_tags() {
    let fakes = Fakes::default();
    seed_registry(&fakes);
    let ctx = fakes.context(Settings::default());
    let reconciler = Reconciler::default();
    reconciler.run_cycle(&ctx).await.unwrap();

    fakes
        .registry
        .images
        .lock()
        .unwrap()
        .insert("prod".to_string(), vec!["shop/web".to_string()]);
    reconciler.run_cycle(&ctx).await.unwrap();

    assert!(!ctx.store.docker_images().contains("prod/shop/api"));
    assert!(ctx.store.docker_tags().find_by(idx::IMAGE, "prod/shop/api").is_empty());
    assert_eq!(ctx.store.docker_tags().len(), 4);
}

#[tokio::test]
async fn test_cancel_stops_between_kinds() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context(Settings::default());
    let cancel = Arc::new(AtomicBool::new(true));

    let summary = Reconciler::new(cancel.clone()).run_cycle(&ctx).await.unwrap();

    assert!(summary.interrupted);
    assert!(summary.outcomes.is_empty());
    assert_eq!(ctx.store.namespaces().len(), 0);

    cancel.store(false, Ordering::SeqCst);
    let summary = Reconciler::new(cancel).run_cycle(&ctx).await.unwrap();
    assert!(!summary.interrupted);
    assert_eq!(summary.outcomes.len(), CYCLE_ORDER.len());
}

#[tokio::test]
async fn test_cycle_persists_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("mirror.json");
    let fakes = Fakes::default();
    seed_workload(&fakes);
    let ctx = fakes.context_with_store(Settings::default(), Arc::new(crate::store::Store::open(&path).unwrap()));

    Reconciler::default().run_cycle(&ctx).await.unwrap();

    let reopened = crate::store::Store::open(&path).unwrap();
    assert_eq!(reopened.namespaces().len(), 2);
    assert_eq!(reopened.pods().len(), 2);
}

#[tokio::test]
async fn test_development_mode_propagates_kind_failure() {
    let fakes = Fakes::default();
    seed_workload(&fakes);
    fakes.cluster.fail(EntityKind::Deployment);
    let settings = Settings {
        env: "development".to_string(),
        ..Settings::default()
    };
    let ctx = fakes.context(settings);

    let err = Reconciler::default().run_cycle(&ctx).await.unwrap_err();

    assert!(matches!(err, crate::error::MirrorError::SourceUnavailable(_)));
    // Kinds before the failure were committed
    assert_eq!(ctx.store.namespaces().len(), 2);
    assert!(ctx.store.pods().is_empty());
}
