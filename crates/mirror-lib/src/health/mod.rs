//! Health of mirrored entities and of the mirror itself

mod evaluator;
mod registry;

pub use evaluator::{
    evaluate, light_for_app, light_for_namespace, Evaluation, Light, Subject, PRESSURE_CONDITIONS,
    UTILIZATION_THRESHOLD,
};
pub use registry::{
    components, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse, SummaryResponse,
};
