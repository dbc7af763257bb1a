//! Traffic-light evaluation of cached entities
//!
//! Everything here is a pure function of its inputs. Aggregation over a
//! namespace or an app reads the store but never writes it.

use crate::models::{Deployment, Namespace, Node, Pod};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Utilization percentage above which a node turns yellow
pub const UTILIZATION_THRESHOLD: f64 = 95.0;

/// Node conditions that turn a node yellow when present
pub const PRESSURE_CONDITIONS: &[&str] = &["OutOfDisk", "MemoryPressure", "DiskPressure", "PIDPressure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Light {
    Green,
    Yellow,
    Red,
    /// The subject could not be evaluated
    Unknown,
}

impl Light {
    fn severity(self) -> u8 {
        match self {
            Light::Green => 0,
            Light::Yellow => 1,
            Light::Unknown => 2,
            Light::Red => 3,
        }
    }

    /// The more severe of two lights
    pub fn worst(self, other: Light) -> Light {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Light::Green => "green",
            Light::Yellow => "yellow",
            Light::Red => "red",
            Light::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Light {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub light: Light,
    pub messages: Vec<String>,
}

impl Evaluation {
    pub fn green() -> Self {
        Self {
            light: Light::Green,
            messages: Vec::new(),
        }
    }

    /// Raise the light to at least `light` and record why
    fn raise(&mut self, light: Light, message: impl Into<String>) {
        self.light = self.light.worst(light);
        self.messages.push(message.into());
    }
}

/// Anything the evaluator can judge
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    DaemonSet {
        desired_scheduled: i32,
        current_scheduled: i32,
    },
    Deployment(&'a Deployment),
    Pod(&'a Pod),
    StatefulSet {
        replicas: i32,
        ready_replicas: i32,
    },
    Node(&'a Node),
    Unsupported(&'a str),
}

pub fn evaluate(subject: &Subject<'_>) -> Evaluation {
    match subject {
        Subject::DaemonSet {
            desired_scheduled,
            current_scheduled,
        } => evaluate_daemon_set(*desired_scheduled, *current_scheduled),
        Subject::Deployment(deployment) => evaluate_deployment(deployment),
        Subject::Pod(pod) => evaluate_pod(pod),
        Subject::StatefulSet {
            replicas,
            ready_replicas,
        } => evaluate_stateful_set(*replicas, *ready_replicas),
        Subject::Node(node) => evaluate_node(node),
        Subject::Unsupported(kind) => Evaluation {
            light: Light::Unknown,
            messages: vec![format!("Cannot evaluate health of kind {}.", kind)],
        },
    }
}

fn evaluate_daemon_set(desired: i32, current: i32) -> Evaluation {
    let mut eval = Evaluation::green();
    if desired != current {
        eval.raise(
            Light::Red,
            format!("Desired scheduled ({}) does not match current scheduled ({}).", desired, current),
        );
    }
    eval
}

fn evaluate_stateful_set(replicas: i32, ready: i32) -> Evaluation {
    let mut eval = Evaluation::green();
    if replicas != ready {
        eval.raise(
            Light::Red,
            format!("Desired replicas ({}) does not match ready replicas ({}).", replicas, ready),
        );
    }
    eval
}

fn evaluate_deployment(deployment: &Deployment) -> Evaluation {
    let mut eval = Evaluation::green();

    for condition in deployment.conditions.iter().filter(|c| c.kind == "Available") {
        if !condition.status {
            let message = condition
                .message
                .clone()
                .unwrap_or_else(|| "Deployment is not available.".to_string());
            eval.raise(Light::Red, message);
        }
    }

    if deployment.replicas != deployment.ready_replicas {
        eval.raise(
            Light::Yellow,
            format!(
                "Desired replicas ({}) does not match ready replicas ({}).",
                deployment.replicas, deployment.ready_replicas
            ),
        );
        if deployment.ready_replicas == 0 {
            eval.raise(Light::Red, "The ready replicas is zero.");
        }
    }

    eval
}

/// Red only on an observed `Ready=False`; a pod that has not reported
/// readiness yet stays green
fn evaluate_pod(pod: &Pod) -> Evaluation {
    let mut eval = Evaluation::green();
    if pod.state == "Succeeded" {
        return eval;
    }
    if let Some(ready) = pod.ready.as_ref().filter(|c| !c.status) {
        let message = ready
            .message
            .clone()
            .unwrap_or_else(|| format!("Pod is not ready ({}).", pod.state));
        eval.raise(Light::Red, message);
    }
    eval
}

fn evaluate_node(node: &Node) -> Evaluation {
    let mut eval = Evaluation::green();

    if !node.has_condition("Ready") {
        eval.raise(Light::Red, "Node is not ready.");
    }
    for condition in PRESSURE_CONDITIONS {
        if node.has_condition(condition) {
            eval.raise(Light::Yellow, format!("Node is suffering {}.", condition));
        }
    }
    if node.cpu_utilization_percent() > UTILIZATION_THRESHOLD {
        eval.raise(Light::Yellow, "Node has high CPU utilization.");
    }
    if node.ram_utilization_percent() > UTILIZATION_THRESHOLD {
        eval.raise(Light::Yellow, "Node has high RAM utilization.");
    }

    eval
}

/// Worst light among a namespace's deployments; the first red stops the scan
pub fn light_for_namespace(store: &Store, namespace: &Namespace) -> Evaluation {
    let mut eval = Evaluation::green();

    for deployment in store.namespace_deployments(&namespace.uid) {
        let deploy_eval = evaluate(&Subject::Deployment(&deployment));
        if deploy_eval.light == Light::Green {
            continue;
        }
        eval.light = eval.light.worst(deploy_eval.light);
        eval.messages.extend(
            deploy_eval
                .messages
                .iter()
                .map(|m| format!("{}: {}", deployment.name, m)),
        );
        if deploy_eval.light == Light::Red {
            break;
        }
    }

    eval
}

/// Worst light among an app's namespaces
pub fn light_for_app(store: &Store, app: &str) -> Evaluation {
    let namespaces = store.app_namespaces(app);
    let mut eval = Evaluation {
        light: Light::Green,
        messages: vec![format!("{} has {} namespaces.", app, namespaces.len())],
    };

    for namespace in &namespaces {
        let ns_eval = light_for_namespace(store, namespace);
        if ns_eval.light == Light::Green {
            continue;
        }
        eval.light = eval.light.worst(ns_eval.light);
        eval.messages.extend(
            ns_eval
                .messages
                .iter()
                .map(|m| format!("{}/{}", namespace.name, m)),
        );
    }

    eval
}
