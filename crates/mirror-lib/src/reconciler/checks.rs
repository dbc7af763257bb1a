//! Configured HTTP health checks

use super::{KindOutcome, Sweep};
use crate::context::Context;
use crate::models::EntityKind;
use crate::sources::{classify_check, SourceResult};
use std::time::Duration;
use tracing::debug;

/// Probe every configured check. Probes never fail, so neither does this;
/// checks removed from settings are swept from the cache.
pub async fn reconcile_health_checks(ctx: &Context) -> SourceResult<KindOutcome> {
    let checks = &ctx.settings.checks;
    let mut sweep = Sweep::new(ctx.store.health_checks(), EntityKind::HealthCheck, checks.len());

    for (name, definition) in checks {
        let spec = definition.spec();
        let response = ctx
            .sources
            .probe
            .get(&spec.uri, &spec.headers, Duration::from_secs(spec.timeout_secs))
            .await;
        let check = classify_check(name, &spec, &response);
        debug!(check = %name, result = %check.result, healthy = ?check.healthy, "Health check probed");
        sweep.upsert(check);
    }

    Ok(sweep.finish())
}
