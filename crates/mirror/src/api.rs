//! HTTP API for health checks, Prometheus metrics and cache reads

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mirror_lib::{
    health::{evaluate, light_for_app, light_for_namespace, HealthRegistry, Light, Subject},
    models::{HealthCheck, Node, Pod, ResourceTotals},
    store::Store,
    ReportLifecycle, Settings,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Reports listed when no limit is given
const DEFAULT_REPORT_LIMIT: usize = 30;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: Arc<Store>,
    pub reports: ReportLifecycle,
    /// Seconds without a finished cycle before the worker counts as stopped
    pub stale_after: i64,
    pub report_interval: i64,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, store: Arc<Store>, settings: &Settings) -> Self {
        Self {
            health_registry,
            reports: ReportLifecycle::new(store.clone()),
            store,
            stale_after: 2 * settings.worker.sleep_secs as i64,
            report_interval: settings.reports.interval().as_secs() as i64,
        }
    }
}

/// 503 only when some component is unhealthy; degraded still answers 200
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the first cycle finished
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Worker liveness and report freshness as a light
async fn summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp();
    let latest = state.reports.latest().map(|r| r.timestamp);
    Json(
        state
            .health_registry
            .summary(latest, now, state.stale_after, state.report_interval)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportListing {
    pub timestamp: i64,
    pub title: String,
}

async fn list_reports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    let listing: Vec<ReportListing> = state
        .reports
        .list()
        .into_iter()
        .take(limit)
        .map(|r| ReportListing {
            title: r.title(),
            timestamp: r.timestamp,
        })
        .collect();
    Json(listing)
}

async fn latest_report(State(state): State<Arc<AppState>>) -> Response {
    match state.reports.latest() {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_report(State(state): State<Arc<AppState>>, Path(timestamp): Path<i64>) -> Response {
    match state.reports.get(timestamp) {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub light: Light,
    pub messages: Vec<String>,
    pub cpu_utilization_percent: f64,
    pub ram_utilization_percent: f64,
}

async fn nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let views: Vec<NodeView> = state
        .store
        .nodes()
        .all()
        .into_iter()
        .map(|node| {
            let evaluation = evaluate(&Subject::Node(&node));
            NodeView {
                cpu_utilization_percent: node.cpu_utilization_percent(),
                ram_utilization_percent: node.ram_utilization_percent(),
                light: evaluation.light,
                messages: evaluation.messages,
                node,
            }
        })
        .collect();
    Json(views)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LightView {
    pub name: String,
    pub light: Light,
    pub messages: Vec<String>,
}

async fn apps(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let views: Vec<LightView> = state
        .store
        .apps()
        .into_iter()
        .map(|app| {
            let evaluation = light_for_app(&state.store, &app);
            LightView {
                name: app,
                light: evaluation.light,
                messages: evaluation.messages,
            }
        })
        .collect();
    Json(views)
}

/// Namespaces of an app, each with its own light
async fn app_namespaces(State(state): State<Arc<AppState>>, Path(app): Path<String>) -> Response {
    let namespaces = state.store.app_namespaces(&app);
    if namespaces.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let views: Vec<LightView> = namespaces
        .iter()
        .map(|ns| {
            let evaluation = light_for_namespace(&state.store, ns);
            LightView {
                name: ns.name.clone(),
                light: evaluation.light,
                messages: evaluation.messages,
            }
        })
        .collect();
    Json(views).into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PodView {
    #[serde(flatten)]
    pub pod: Pod,
    pub light: Light,
    pub messages: Vec<String>,
    pub resources: ResourceTotals,
}

async fn get_pod(State(state): State<Arc<AppState>>, Path(uid): Path<String>) -> Response {
    let Some(pod) = state.store.pods().find_one(&uid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let evaluation = evaluate(&Subject::Pod(&pod));
    Json(PodView {
        resources: state.store.pod_resources(&uid),
        light: evaluation.light,
        messages: evaluation.messages,
        pod,
    })
    .into_response()
}

async fn health_checks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let checks: Vec<HealthCheck> = state.store.health_checks().all();
    Json(checks)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/summary", get(summary))
        .route("/reports", get(list_reports))
        .route("/reports/latest", get(latest_report))
        .route("/reports/:timestamp", get(get_report))
        .route("/nodes", get(nodes))
        .route("/apps", get(apps))
        .route("/apps/:app", get(app_namespaces))
        .route("/pods/:uid", get(get_pod))
        .route("/health-checks", get(health_checks))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mirror_lib::health::components;
    use mirror_lib::models::{Namespace, Report, StringMap};
    use tower::ServiceExt;

    async fn setup_test_app() -> (Router, Arc<AppState>) {
        let health_registry = HealthRegistry::new();
        health_registry.register_all().await;

        let state = Arc::new(AppState::new(
            health_registry,
            Arc::new(Store::in_memory()),
            &Settings::default(),
        ));
        (create_router(state.clone()), state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn node(name: &str, conditions: &[&str]) -> Node {
        Node {
            name: name.to_string(),
            hostname: None,
            internal_ip: None,
            annotations: StringMap::new(),
            labels: StringMap::new(),
            kernel_version: None,
            kubelet_version: None,
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            cpu_allocatable: 4.0,
            cpu_utilized: 2.0,
            ram_allocatable: 8e9,
            ram_utilized: 1e9,
            cpu_allocation_percent: None,
            ram_allocation_percent: None,
        }
    }

    #[tokio::test]
    async fn test_healthz_healthy() {
        let (app, _) = setup_test_app().await;

        let (status, json) = get_json(app, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_healthz_unhealthy_component() {
        let (app, state) = setup_test_app().await;
        state
            .health_registry
            .set_unhealthy(components::STORE, "disk full")
            .await;

        let (status, json) = get_json(app, "/healthz").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["components"]["store"]["message"], "disk full");
    }

    #[tokio::test]
    async fn test_readyz_waits_for_first_cycle() {
        let (app, state) = setup_test_app().await;

        let (status, json) = get_json(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "waiting for the first reconciliation cycle");

        state.health_registry.set_ready(true).await;
        let (status, _) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = setup_test_app().await;

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
    }

    #[tokio::test]
    async fn test_summary_red_without_cycles() {
        let (app, _) = setup_test_app().await;

        let (status, json) = get_json(app, "/summary").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["light"], "red");
        assert_eq!(json["worker_running"], false);
    }

    #[tokio::test]
    async fn test_reports_only_expose_complete() {
        let (app, state) = setup_test_app().await;

        let (status, _) = get_json(app.clone(), "/reports/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        for timestamp in [100, 200] {
            state.store.reports().upsert(Report {
                complete: true,
                ..Report::pending(timestamp)
            });
        }
        state.store.reports().upsert(Report::pending(300));
        state.store.set_latest_report(Some(200));

        let (status, json) = get_json(app.clone(), "/reports/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["timestamp"], 200);

        let (_, json) = get_json(app.clone(), "/reports?limit=5").await;
        let listed: Vec<i64> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(listed, vec![200, 100]);

        let (status, _) = get_json(app.clone(), "/reports/300").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(app, "/reports/100").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_nodes_carry_lights() {
        let (app, state) = setup_test_app().await;
        state.store.nodes().upsert(node("node-a", &["Ready"]));
        state.store.nodes().upsert(node("node-b", &["Ready", "DiskPressure"]));
        state.store.nodes().upsert(node("node-c", &[]));

        let (status, json) = get_json(app, "/nodes").await;

        assert_eq!(status, StatusCode::OK);
        let lights: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["light"].as_str().unwrap())
            .collect();
        assert_eq!(lights, vec!["green", "yellow", "red"]);
        assert_eq!(json[0]["cpu_utilization_percent"], 50.0);
        assert_eq!(json[1]["messages"][0], "Node is suffering DiskPressure.");
    }

    #[tokio::test]
    async fn test_apps_and_namespaces() {
        let (app, state) = setup_test_app().await;
        for (uid, name) in [("1", "shop-prod"), ("2", "shop-perf"), ("3", "kube-system")] {
            state.store.namespaces().upsert(Namespace::new(
                uid.to_string(),
                name.to_string(),
                StringMap::new(),
                StringMap::new(),
            ));
        }

        let (_, json) = get_json(app.clone(), "/apps").await;
        assert_eq!(json[0]["name"], "shop");
        assert_eq!(json[0]["light"], "green");
        assert_eq!(json[0]["messages"][0], "shop has 2 namespaces.");

        let (status, json) = get_json(app.clone(), "/apps/shop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);

        let (status, _) = get_json(app, "/apps/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_pod() {
        let (app, _) = setup_test_app().await;

        let (status, _) = get_json(app, "/pods/missing").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
