//! Self-health of the mirror process
//!
//! Each source and subsystem reports how its part of the last cycle went.
//! The worst of those statuses drives `/healthz`; readiness additionally
//! waits for the first complete cycle.

use super::Light;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst so that a rollup is a `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Part of this cycle's work failed; cached data is still served
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the owning subsystem last reported
    pub updated_at: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Worker liveness plus freshness of the latest report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub light: Light,
    pub worker_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_report: Option<i64>,
    pub messages: Vec<String>,
}

/// Names under which subsystems report
pub mod components {
    pub const CLUSTER: &str = "cluster";
    pub const METRICS: &str = "metrics";
    pub const REGISTRY: &str = "registry";
    pub const CHECKS: &str = "checks";
    pub const STORE: &str = "store";
    pub const REPORTS: &str = "reports";

    pub const ALL: &[&str] = &[CLUSTER, METRICS, REGISTRY, CHECKS, STORE, REPORTS];
}

#[derive(Debug, Default)]
struct RegistryState {
    components: HashMap<String, ComponentHealth>,
    first_cycle_done: bool,
    last_cycle: Option<i64>,
}

/// Shared handle; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every known component out healthy
    pub async fn register_all(&self) {
        let mut state = self.state.write().await;
        for name in components::ALL {
            state
                .components
                .insert(name.to_string(), ComponentHealth::new(ComponentStatus::Healthy, None));
        }
    }

    async fn report(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::new(status, message));
    }

    pub async fn set_healthy(&self, name: &str) {
        self.report(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.first_cycle_done = ready;
    }

    pub async fn cycle_finished(&self, timestamp: i64) {
        self.state.write().await.last_cycle = Some(timestamp);
    }

    pub async fn last_cycle(&self) -> Option<i64> {
        self.state.read().await.last_cycle
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.state.read().await.components.clone())
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let first_cycle_done = self.state.read().await.first_cycle_done;
        let reason = if !first_cycle_done {
            Some("waiting for the first reconciliation cycle")
        } else if !self.health().await.status.is_operational() {
            Some("a component is unhealthy")
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }

    /// Green while cycles run and reports stay fresh. A cycle older than
    /// `stale_after` turns the summary red; a missing or overdue report
    /// turns it yellow.
    pub async fn summary(
        &self,
        latest_report: Option<i64>,
        now: i64,
        stale_after: i64,
        report_interval: i64,
    ) -> SummaryResponse {
        let last_cycle = self.last_cycle().await;
        let worker_running = matches!(last_cycle, Some(ts) if now - ts <= stale_after);
        let mut light = Light::Green;
        let mut messages = Vec::new();

        if !worker_running {
            light = Light::Red;
            messages.push("Worker has not completed a recent cycle.".to_string());
        }
        match latest_report {
            None => {
                light = light.worst(Light::Yellow);
                messages.push("No report has been generated.".to_string());
            }
            Some(ts) if now - ts > report_interval * 2 => {
                light = light.worst(Light::Yellow);
                messages.push(format!("Latest report {} is overdue.", ts));
            }
            Some(_) => {}
        }

        SummaryResponse {
            light,
            worker_running,
            last_cycle_timestamp: last_cycle,
            latest_report,
            messages,
        }
    }
}
