//! Observability infrastructure for the mirror
//!
//! Provides:
//! - Prometheus metrics (cycle duration, per-kind failures and row counts, report lifecycle)
//! - Structured JSON logging with tracing

use crate::models::EntityKind;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MirrorMetricsInner> = OnceLock::new();

struct MirrorMetricsInner {
    cycle_duration_seconds: Histogram,
    kind_failures: IntCounterVec,
    entities: IntGaugeVec,
    reports_generated: IntCounter,
    reports_failed: IntCounter,
    reports_purged: IntCounter,
    last_cycle_timestamp: IntGauge,
}

impl MirrorMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "cluster_mirror_cycle_duration_seconds",
                "Time spent on one full reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            kind_failures: register_int_counter_vec!(
                "cluster_mirror_kind_failures_total",
                "Reconciliations of an entity kind skipped because its source failed",
                &["kind"]
            )
            .expect("Failed to register kind_failures"),

            entities: register_int_gauge_vec!(
                "cluster_mirror_entities",
                "Cached rows per entity kind",
                &["kind"]
            )
            .expect("Failed to register entities"),

            reports_generated: register_int_counter!(
                "cluster_mirror_reports_generated_total",
                "Reports materialized successfully"
            )
            .expect("Failed to register reports_generated"),

            reports_failed: register_int_counter!(
                "cluster_mirror_reports_failed_total",
                "Report builds rolled back after a failure"
            )
            .expect("Failed to register reports_failed"),

            reports_purged: register_int_counter!(
                "cluster_mirror_reports_purged_total",
                "Reports deleted by the retention policy"
            )
            .expect("Failed to register reports_purged"),

            last_cycle_timestamp: register_int_gauge!(
                "cluster_mirror_last_cycle_timestamp_seconds",
                "Unix time the last cycle finished"
            )
            .expect("Failed to register last_cycle_timestamp"),
        }
    }
}

/// Mirror metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MirrorMetrics {
    _private: (),
}

impl Default for MirrorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MirrorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MirrorMetricsInner {
        GLOBAL_METRICS.get_or_init(MirrorMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    pub fn inc_kind_failure(&self, kind: EntityKind) {
        self.inner()
            .kind_failures
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn set_entity_count(&self, kind: EntityKind, count: usize) {
        self.inner()
            .entities
            .with_label_values(&[kind.as_str()])
            .set(count as i64);
    }

    pub fn inc_reports_generated(&self) {
        self.inner().reports_generated.inc();
    }

    pub fn inc_reports_failed(&self) {
        self.inner().reports_failed.inc();
    }

    pub fn add_reports_purged(&self, count: usize) {
        self.inner().reports_purged.inc_by(count as u64);
    }

    pub fn set_last_cycle_timestamp(&self, timestamp: i64) {
        self.inner().last_cycle_timestamp.set(timestamp);
    }
}

/// Structured logger for mirror events
///
/// Every significant lifecycle event goes through here so each carries an
/// `event` field and the instance name.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, env: &str) {
        info!(
            event = "mirror_started",
            instance = %self.instance,
            version = %version,
            env = %env,
            "Cluster mirror started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "mirror_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Cluster mirror shutting down"
        );
    }

    pub fn log_cycle_complete(&self, duration_secs: f64, failed_kinds: &[EntityKind], upserted: usize, deleted: usize) {
        let failed: Vec<&str> = failed_kinds.iter().map(|k| k.as_str()).collect();
        info!(
            event = "cycle_complete",
            instance = %self.instance,
            duration_secs = duration_secs,
            failed_kinds = ?failed,
            upserted = upserted,
            deleted = deleted,
            "Completed refresh in {:.2} seconds",
            duration_secs
        );
    }

    pub fn log_kind_failed(&self, kind: EntityKind, reason: &str) {
        warn!(
            event = "kind_failed",
            instance = %self.instance,
            kind = %kind,
            reason = %reason,
            "Reconciliation skipped, keeping cached rows"
        );
    }

    pub fn log_report_generated(&self, timestamp: i64, nodes: usize, restarts: usize, unhealthy_pods: usize) {
        info!(
            event = "report_generated",
            instance = %self.instance,
            timestamp = timestamp,
            nodes = nodes,
            restarts = restarts,
            unhealthy_pods = unhealthy_pods,
            "Report materialized"
        );
    }

    pub fn log_report_failed(&self, timestamp: i64, reason: &str) {
        error!(
            event = "report_failed",
            instance = %self.instance,
            timestamp = timestamp,
            reason = %reason,
            "Report build failed, partial report deleted"
        );
    }

    pub fn log_reports_purged(&self, count: usize, cutoff: i64) {
        info!(
            event = "reports_purged",
            instance = %self.instance,
            count = count,
            cutoff = cutoff,
            "Purged expired reports"
        );
    }

    pub fn log_config_reloaded(&self, success: bool, detail: &str) {
        if success {
            info!(
                event = "config_reloaded",
                instance = %self.instance,
                "Configuration reloaded, sources reconnected"
            );
        } else {
            warn!(
                event = "config_reload_failed",
                instance = %self.instance,
                reason = %detail,
                "Configuration reload failed, keeping previous settings"
            );
        }
    }
}
