//! Process-wide state handed to the reconciler and report lifecycle
//!
//! Built once after the instance lock is taken. A reload swaps settings and
//! sources in place; the store is never rebuilt.

use crate::config::Settings;
use crate::health::HealthRegistry;
use crate::observability::{MirrorMetrics, StructuredLogger};
use crate::sources::Sources;
use crate::store::Store;
use std::sync::Arc;

pub struct Context {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub sources: Sources,
    pub metrics: MirrorMetrics,
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
}

impl Context {
    pub fn new(
        settings: Settings,
        store: Arc<Store>,
        sources: Sources,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            settings,
            store,
            sources,
            metrics: MirrorMetrics::new(),
            health,
            logger,
        }
    }

    /// Replace settings and sources, keeping the cache
    pub fn reload(&mut self, settings: Settings, sources: Sources) {
        self.settings = settings;
        self.sources = sources;
    }
}
