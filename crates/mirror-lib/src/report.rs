//! Report lifecycle
//!
//! A report is written as a pending row and committed before it is
//! populated, so a crash mid-build leaves an incomplete row that
//! [`ReportLifecycle::recover`] removes on the next start. Only complete
//! reports are ever referenced by the latest pointer.

use crate::context::Context;
use crate::error::{MirrorError, Result};
use crate::health::components;
use crate::models::{NodeSnapshot, Report, Restart, UnhealthyPod};
use crate::store::{idx, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pods whose restart counter grew over the last day
pub const RESTARTS_QUERY: &str = "floor(delta(kube_pod_container_status_restarts_total[24h])) > 0";

/// Builds, retires and reads reports in the cache
#[derive(Clone)]
pub struct ReportLifecycle {
    store: Arc<Store>,
}

impl ReportLifecycle {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// True when no complete report exists or the newest is older than `interval`
    pub fn should_generate(&self, interval: Duration, now: i64) -> bool {
        match self.latest() {
            None => true,
            Some(report) => now - report.timestamp > interval.as_secs() as i64,
        }
    }

    /// Materialize a report from the cache and a live restarts query.
    ///
    /// The timestamp is `now`, bumped past the newest existing report so
    /// keys stay unique. On failure the pending row is deleted.
    pub async fn generate(&self, ctx: &Context, now: i64, errors: Vec<String>) -> Result<Report> {
        let newest = self.store.reports().keys().iter().filter_map(|k| k.parse::<i64>().ok()).max();
        let timestamp = match newest {
            Some(ts) if ts >= now => ts + 1,
            _ => now,
        };

        self.store.reports().upsert(Report::pending(timestamp));
        self.store.persist()?;
        debug!(timestamp, "Pending report written");

        match self.populate(ctx, timestamp, errors).await {
            Ok(report) => {
                self.store.reports().upsert(report.clone());
                self.store.set_latest_report(Some(timestamp));
                self.store.persist()?;

                ctx.metrics.inc_reports_generated();
                ctx.health.set_healthy(components::REPORTS).await;
                ctx.logger.log_report_generated(
                    timestamp,
                    report.nodes.len(),
                    report.restarts.len(),
                    report.unhealthy_pods.len(),
                );
                Ok(report)
            }
            Err(reason) => {
                self.store.reports().delete(&timestamp.to_string());
                if let Err(e) = self.store.persist() {
                    warn!(timestamp, error = %e, "Failed to persist removal of partial report");
                }

                ctx.metrics.inc_reports_failed();
                ctx.health.set_degraded(components::REPORTS, reason.clone()).await;
                ctx.logger.log_report_failed(timestamp, &reason);
                Err(MirrorError::ReportBuildFailure { timestamp, reason })
            }
        }
    }

    async fn populate(&self, ctx: &Context, timestamp: i64, mut errors: Vec<String>) -> Result<Report, String> {
        let samples = ctx
            .sources
            .metrics
            .query(RESTARTS_QUERY)
            .await
            .map_err(|e| format!("restarts query: {}", e))?;

        let mut restarts = Vec::with_capacity(samples.len());
        for sample in samples {
            match sample.labels.get("pod") {
                Some(pod) => restarts.push(Restart {
                    namespace: sample.labels.get("namespace").cloned(),
                    pod: pod.clone(),
                    count: sample.value,
                }),
                None => errors.push("restart sample without pod label".to_string()),
            }
        }
        restarts.sort_by(|a, b| (&a.namespace, &a.pod).cmp(&(&b.namespace, &b.pod)));

        let unhealthy_pods = self
            .store
            .unhealthy_pods()
            .into_iter()
            .map(|pod| UnhealthyPod {
                namespace: pod.namespace,
                pod: pod.name,
                state: pod.state,
            })
            .collect();

        Ok(Report {
            timestamp,
            complete: true,
            nodes: self.store.nodes().all().iter().map(NodeSnapshot::from).collect(),
            restarts,
            unhealthy_pods,
            health_checks: self.store.health_checks().all(),
            errors,
        })
    }

    /// Delete complete reports older than `now - window`. Returns how many went.
    pub fn purge_older_than(&self, window: Duration, now: i64) -> Result<usize> {
        let cutoff = now - window.as_secs() as i64;
        let expired = self
            .store
            .reports()
            .find(|r| r.complete && r.timestamp < cutoff);
        if expired.is_empty() {
            return Ok(0);
        }

        for report in &expired {
            self.store.reports().delete(&report.timestamp.to_string());
        }
        self.repoint_latest();
        self.store.persist()?;

        info!(count = expired.len(), cutoff, "Expired reports removed");
        Ok(expired.len())
    }

    /// Drop reports left incomplete by a crash and fix the latest pointer
    pub fn recover(&self) -> Result<usize> {
        let pending = self.store.reports().find_by(idx::COMPLETE, "false");
        for report in &pending {
            warn!(timestamp = report.timestamp, "Removing incomplete report");
            self.store.reports().delete(&report.timestamp.to_string());
        }

        let before = self.store.latest_report();
        self.repoint_latest();
        if !pending.is_empty() || before != self.store.latest_report() {
            self.store.persist()?;
        }
        Ok(pending.len())
    }

    fn repoint_latest(&self) {
        let newest = self.complete().into_iter().map(|r| r.timestamp).max();
        self.store.set_latest_report(newest);
    }

    fn complete(&self) -> Vec<Report> {
        self.store.reports().find_by(idx::COMPLETE, "true")
    }

    /// Report the latest pointer references
    pub fn latest(&self) -> Option<Report> {
        let timestamp = self.store.latest_report()?;
        self.get(timestamp)
    }

    /// Timestamps of the newest `n` complete reports, newest first
    pub fn latest_timestamps(&self, n: usize) -> Vec<i64> {
        self.list().into_iter().take(n).map(|r| r.timestamp).collect()
    }

    /// Complete reports, newest first
    pub fn list(&self) -> Vec<Report> {
        let mut reports = self.complete();
        reports.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        reports
    }

    pub fn get(&self, timestamp: i64) -> Option<Report> {
        self.store
            .reports()
            .find_one(&timestamp.to_string())
            .filter(|r| r.complete)
    }
}
