//! The control loop: reconcile, report, sleep
//!
//! Phases run strictly in order. Reload requests are applied only while
//! idle, and a shutdown request is honoured between kinds, between phases
//! and during sleep.

use crate::config::Settings;
use crate::context::Context;
use crate::error::{MirrorError, Result};
use crate::reconciler::{CycleSummary, Reconciler};
use crate::report::ReportLifecycle;
use crate::sources::Sources;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::Control;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Reconciling,
    Reporting,
    Sleeping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Reconciling => "reconciling",
            Phase::Reporting => "reporting",
            Phase::Sleeping => "sleeping",
        };
        f.write_str(name)
    }
}

/// Produces fresh settings and sources on reload
pub type Loader = Box<dyn Fn() -> Result<(Settings, Sources)> + Send + Sync>;

/// Reload from the settings file and reconnect every source
pub fn default_loader() -> Loader {
    Box::new(|| {
        let settings = Settings::load()?;
        let sources = Sources::connect(&settings)?;
        Ok((settings, sources))
    })
}

pub struct Scheduler {
    ctx: Context,
    reports: ReportLifecycle,
    loader: Loader,
    phase: Phase,
    cycles: u64,
}

impl Scheduler {
    pub fn new(ctx: Context, loader: Loader) -> Self {
        let reports = ReportLifecycle::new(ctx.store.clone());
        Self {
            ctx,
            reports,
            loader,
            phase: Phase::Idle,
            cycles: 0,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed cycles since start
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
    }

    /// Run until shutdown. Errors escape only in development mode.
    pub async fn run(&mut self, control: &Control) -> Result<()> {
        let reconciler = Reconciler::new(control.cancel_flag());

        loop {
            self.enter(Phase::Idle);
            if control.is_shutting_down() {
                break;
            }
            if control.take_reload() {
                self.reload();
            }

            self.enter(Phase::Reconciling);
            let summary = match reconciler.run_cycle(&self.ctx).await {
                Ok(summary) => {
                    self.cycles += 1;
                    self.ctx.health.set_ready(true).await;
                    Some(summary)
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation cycle failed");
                    if self.ctx.settings.is_development() {
                        return Err(e);
                    }
                    None
                }
            };
            if control.is_shutting_down() {
                break;
            }

            self.enter(Phase::Reporting);
            if let Err(e) = self.report(summary.as_ref()).await {
                error!(error = %e, "Report step failed");
                if self.ctx.settings.is_development() {
                    return Err(e);
                }
            }
            if control.is_shutting_down() {
                break;
            }

            self.enter(Phase::Sleeping);
            let sleep = self.ctx.settings.sleep();
            debug!(seconds = sleep.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = control.woken() => {
                    debug!("Sleep interrupted");
                }
            }
        }

        self.enter(Phase::Idle);
        info!(cycles = self.cycles, "Scheduler stopped");
        Ok(())
    }

    /// Generate a report when one is due, then retire expired ones
    async fn report(&self, summary: Option<&CycleSummary>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let settings = &self.ctx.settings.reports;

        if self.reports.should_generate(settings.interval(), now) {
            let errors = summary
                .map(|s| {
                    s.failures
                        .iter()
                        .map(|f| format!("{}: {}", f.kind, f.reason))
                        .collect()
                })
                .unwrap_or_default();
            match self.reports.generate(&self.ctx, now, errors).await {
                Ok(_) => {}
                Err(MirrorError::ReportBuildFailure { timestamp, reason }) => {
                    warn!(timestamp, reason = %reason, "Report skipped this cycle");
                }
                Err(e) => return Err(e),
            }
        }

        let retention = settings.retention();
        let purged = self.reports.purge_older_than(retention, now)?;
        if purged > 0 {
            self.ctx.metrics.add_reports_purged(purged);
            self.ctx
                .logger
                .log_reports_purged(purged, now - retention.as_secs() as i64);
        }
        Ok(())
    }

    /// Swap in fresh settings and sources; on failure keep the current ones
    fn reload(&mut self) {
        match (self.loader)() {
            Ok((settings, sources)) => {
                self.ctx.reload(settings, sources);
                self.ctx.logger.log_config_reloaded(true, "settings and sources replaced");
            }
            Err(e) => {
                let failure = MirrorError::ConfigReloadFailure(e.to_string());
                self.ctx.logger.log_config_reloaded(false, &failure.to_string());
            }
        }
    }
}
