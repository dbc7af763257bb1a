//! Reconciliation of the cache against the external sources
//!
//! Kinds are processed in dependency order. Each kind fetches its full
//! collection, upserts every item and then deletes the cached rows that
//! were not observed. A failed fetch skips the kind and leaves its rows
//! untouched; later kinds resolve relations against whatever is cached.

mod checks;
mod cluster;
mod normalize;
mod registry;

#[cfg(test)]
mod tests;

pub use checks::reconcile_health_checks;
pub use cluster::{
    reconcile_deployments, reconcile_events, reconcile_namespaces, reconcile_nodes, reconcile_pods,
    reconcile_replica_sets,
};
pub use normalize::{Malformed, NodeFigures};
pub use registry::reconcile_registry;

use crate::context::Context;
use crate::error::Result;
use crate::health::components;
use crate::models::EntityKind;
use crate::sources::{Listing, SourceResult};
use crate::store::{Entity, Table, Upsert};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kinds in the order a cycle visits them
pub const CYCLE_ORDER: &[EntityKind] = &[
    EntityKind::Node,
    EntityKind::Namespace,
    EntityKind::Deployment,
    EntityKind::ReplicaSet,
    EntityKind::Pod,
    EntityKind::Event,
    EntityKind::HealthCheck,
    EntityKind::DockerImage,
];

/// Health component fed by a kind's source
fn component_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::HealthCheck => components::CHECKS,
        EntityKind::DockerImage | EntityKind::DockerTag => components::REGISTRY,
        _ => components::CLUSTER,
    }
}

/// What one kind's reconciliation did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindOutcome {
    pub kind: Option<EntityKind>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Items skipped as malformed
    pub skipped: usize,
    /// Problems that did not abort the kind
    pub warnings: Vec<String>,
}

impl KindOutcome {
    pub fn new(kind: EntityKind, fetched: usize) -> Self {
        Self {
            kind: Some(kind),
            fetched,
            ..Self::default()
        }
    }

    fn record(&mut self, upsert: Upsert) {
        match upsert {
            Upsert::Inserted => self.inserted += 1,
            Upsert::Updated => self.updated += 1,
            Upsert::Unchanged => self.unchanged += 1,
        }
    }

    /// Fold a nested kind's counts into this outcome
    fn absorb(&mut self, other: KindOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.warnings.extend(other.warnings);
    }

    pub fn upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindFailure {
    pub kind: EntityKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub started_at: i64,
    pub duration_secs: f64,
    pub outcomes: Vec<KindOutcome>,
    pub failures: Vec<KindFailure>,
    /// Shutdown was requested before every kind ran
    pub interrupted: bool,
}

impl CycleSummary {
    pub fn outcome(&self, kind: EntityKind) -> Option<&KindOutcome> {
        self.outcomes.iter().find(|o| o.kind == Some(kind))
    }

    pub fn failed(&self, kind: EntityKind) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }

    pub fn failed_kinds(&self) -> Vec<EntityKind> {
        self.failures.iter().map(|f| f.kind).collect()
    }
}

/// Upserts rows of one kind and deletes whatever was not observed
pub(crate) struct Sweep<'a, T: Entity> {
    table: &'a Table<T>,
    observed: HashSet<String>,
    outcome: KindOutcome,
}

impl<'a, T: Entity> Sweep<'a, T> {
    pub(crate) fn new(table: &'a Table<T>, kind: EntityKind, fetched: usize) -> Self {
        Self {
            table,
            observed: HashSet::with_capacity(fetched),
            outcome: KindOutcome::new(kind, fetched),
        }
    }

    /// Start a sweep over a list response, skipping the items that did not decode
    pub(crate) fn over<R>(table: &'a Table<T>, kind: EntityKind, listing: &Listing<R>) -> Self {
        let mut sweep = Self::new(table, kind, listing.len());
        for item in &listing.undecodable {
            sweep.malformed(normalize::Malformed::from(item.clone()));
        }
        sweep
    }

    pub(crate) fn upsert(&mut self, row: T) {
        self.observed.insert(row.key());
        let result = self.table.upsert(row);
        self.outcome.record(result);
    }

    /// Skip a malformed item; its cached row survives when the key is known
    pub(crate) fn malformed(&mut self, malformed: normalize::Malformed) {
        warn!(
            kind = %T::KIND,
            key = ?malformed.key,
            reason = %malformed.reason,
            "Skipping malformed item"
        );
        if let Some(key) = malformed.key {
            self.observed.insert(key);
        }
        self.outcome.skipped += 1;
    }

    pub(crate) fn apply(&mut self, row: normalize::Normalized<T>) {
        match row {
            Ok(row) => self.upsert(row),
            Err(malformed) => self.malformed(malformed),
        }
    }

    /// Keep a cached row without touching it
    pub(crate) fn retain(&mut self, key: String) {
        self.observed.insert(key);
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.outcome.warnings.push(message.into());
    }

    pub(crate) fn finish(self) -> KindOutcome {
        let mut outcome = self.outcome;
        outcome.deleted = self.table.retain_keys(&self.observed).len();
        outcome
    }

    /// Like [`Sweep::finish`] with a custom delete for cascading kinds
    pub(crate) fn finish_with(self, delete: impl Fn(&str) -> bool) -> KindOutcome {
        let mut outcome = self.outcome;
        let stale: Vec<String> = self
            .table
            .keys()
            .into_iter()
            .filter(|k| !self.observed.contains(k))
            .collect();
        outcome.deleted = stale.iter().filter(|k| delete(k.as_str())).count();
        outcome
    }
}

/// Runs reconciliation cycles
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    cancel: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn reconcile_kind(&self, ctx: &Context, kind: EntityKind) -> SourceResult<KindOutcome> {
        match kind {
            EntityKind::Node => reconcile_nodes(ctx).await,
            EntityKind::Namespace => reconcile_namespaces(ctx).await,
            EntityKind::Deployment => reconcile_deployments(ctx).await,
            EntityKind::ReplicaSet => reconcile_replica_sets(ctx).await,
            EntityKind::Pod => reconcile_pods(ctx).await,
            EntityKind::Event => reconcile_events(ctx).await,
            EntityKind::HealthCheck => reconcile_health_checks(ctx).await,
            EntityKind::DockerImage => reconcile_registry(ctx).await,
            other => Ok(KindOutcome::new(other, 0)),
        }
    }

    /// One full pass over every kind. Shutdown is honoured only between
    /// kinds and the store is committed after each one.
    pub async fn run_cycle(&self, ctx: &Context) -> Result<CycleSummary> {
        let start = Instant::now();
        let mut summary = CycleSummary {
            started_at: chrono::Utc::now().timestamp(),
            ..CycleSummary::default()
        };

        info!("Refreshing result data");

        for &kind in CYCLE_ORDER {
            if self.cancelled() {
                info!(next_kind = %kind, "Shutdown requested, stopping cycle between kinds");
                summary.interrupted = true;
                break;
            }

            match self.reconcile_kind(ctx, kind).await {
                Ok(outcome) => {
                    debug!(
                        kind = %kind,
                        fetched = outcome.fetched,
                        upserted = outcome.upserted(),
                        deleted = outcome.deleted,
                        skipped = outcome.skipped,
                        "Kind reconciled"
                    );
                    summary.outcomes.push(outcome);
                }
                Err(e) => {
                    ctx.metrics.inc_kind_failure(kind);
                    ctx.logger.log_kind_failed(kind, &e.to_string());
                    if ctx.settings.is_development() {
                        return Err(e.into());
                    }
                    summary.failures.push(KindFailure {
                        kind,
                        reason: e.to_string(),
                    });
                }
            }

            if let Err(e) = ctx.store.persist() {
                ctx.health
                    .set_unhealthy(components::STORE, e.to_string())
                    .await;
                return Err(e);
            }
        }

        self.update_component_health(ctx, &summary).await;
        for (kind, count) in ctx.store.counts() {
            ctx.metrics.set_entity_count(kind, count);
        }

        summary.duration_secs = start.elapsed().as_secs_f64();
        let finished_at = chrono::Utc::now().timestamp();
        ctx.metrics.observe_cycle_duration(summary.duration_secs);
        ctx.metrics.set_last_cycle_timestamp(finished_at);
        ctx.health.cycle_finished(finished_at).await;

        let upserted = summary.outcomes.iter().map(KindOutcome::upserted).sum();
        let deleted = summary.outcomes.iter().map(|o| o.deleted).sum();
        ctx.logger
            .log_cycle_complete(summary.duration_secs, &summary.failed_kinds(), upserted, deleted);

        Ok(summary)
    }

    async fn update_component_health(&self, ctx: &Context, summary: &CycleSummary) {
        for component in [components::CLUSTER, components::CHECKS, components::REGISTRY] {
            let failures: Vec<&KindFailure> = summary
                .failures
                .iter()
                .filter(|f| component_for(f.kind) == component)
                .collect();
            let attempted = CYCLE_ORDER
                .iter()
                .filter(|k| component_for(**k) == component)
                .count();

            if failures.is_empty() {
                ctx.health.set_healthy(component).await;
            } else if failures.len() == attempted {
                ctx.health
                    .set_unhealthy(component, failures[0].reason.clone())
                    .await;
            } else {
                let kinds: Vec<&str> = failures.iter().map(|f| f.kind.as_str()).collect();
                ctx.health
                    .set_degraded(component, format!("failed kinds: {}", kinds.join(", ")))
                    .await;
            }
        }

        let metrics_warnings = summary
            .outcome(EntityKind::Node)
            .map(|o| o.warnings.len())
            .unwrap_or(0);
        if metrics_warnings == 0 {
            ctx.health.set_healthy(components::METRICS).await;
        } else {
            ctx.health
                .set_degraded(
                    components::METRICS,
                    format!("{} node metric lookups failed", metrics_warnings),
                )
                .await;
        }

        ctx.health.set_healthy(components::STORE).await;
    }
}
