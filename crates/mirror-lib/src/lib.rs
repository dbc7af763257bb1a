//! Cluster mirror library
//!
//! This crate provides the core functionality for:
//! - Mirroring cluster, metrics and registry state into a local cache
//! - Health lights for nodes, deployments, namespaces and apps
//! - Periodic health reports with bounded retention
//! - The single-instance control loop and its self-health

pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod reconciler;
pub mod report;
pub mod runtime;
pub mod sources;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use context::Context;
pub use error::{MirrorError, Result, SourceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, Light, ReadinessResponse,
};
pub use observability::{MirrorMetrics, StructuredLogger};
pub use report::ReportLifecycle;
pub use store::Store;
