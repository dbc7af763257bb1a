//! Keys and secondary indexes for each cached kind

use super::table::Entity;
use crate::models::*;

/// Secondary index names
pub mod idx {
    pub const NAME: &str = "name";
    pub const APP: &str = "app";
    pub const CONDITION: &str = "condition";
    pub const NAMESPACE: &str = "namespace_uid";
    pub const NAMESPACE_STATE: &str = "namespace_state";
    pub const DEPLOYMENT: &str = "deployment_uid";
    pub const NODE: &str = "node";
    pub const HEALTHY: &str = "healthy";
    pub const POD: &str = "pod";
    pub const IMAGE: &str = "image";
    pub const REPO: &str = "repo";
    pub const KIND: &str = "kind";
    pub const COMPLETE: &str = "complete";
}

/// Key under which a pod's rows are found in the `namespace_state` index
pub fn namespace_state_key(namespace: &str, state: &str) -> String {
    format!("{}/{}", namespace, state)
}

fn push_opt(out: &mut Vec<(&'static str, String)>, index: &'static str, value: &Option<String>) {
    if let Some(v) = value {
        out.push((index, v.clone()));
    }
}

impl Entity for Node {
    const KIND: EntityKind = EntityKind::Node;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        self.conditions
            .iter()
            .map(|c| (idx::CONDITION, c.clone()))
            .collect()
    }
}

impl Entity for Namespace {
    const KIND: EntityKind = EntityKind::Namespace;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(idx::NAME, self.name.clone())];
        push_opt(&mut out, idx::APP, &self.app);
        out
    }
}

impl Entity for Deployment {
    const KIND: EntityKind = EntityKind::Deployment;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(idx::NAME, self.name.clone())];
        push_opt(&mut out, idx::NAMESPACE, &self.namespace_uid);
        out
    }
}

impl Entity for ReplicaSet {
    const KIND: EntityKind = EntityKind::ReplicaSet;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(idx::NAME, self.name.clone())];
        push_opt(&mut out, idx::NAMESPACE, &self.namespace_uid);
        push_opt(&mut out, idx::DEPLOYMENT, &self.deployment_uid);
        out
    }
}

impl Entity for Pod {
    const KIND: EntityKind = EntityKind::Pod;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (idx::NAME, self.name.clone()),
            (
                idx::NAMESPACE_STATE,
                namespace_state_key(&self.namespace, &self.state),
            ),
            (idx::HEALTHY, self.healthy().to_string()),
        ];
        push_opt(&mut out, idx::NAMESPACE, &self.namespace_uid);
        push_opt(&mut out, idx::DEPLOYMENT, &self.deployment_uid);
        push_opt(&mut out, idx::NODE, &self.node_name);
        out
    }
}

impl Entity for Container {
    const KIND: EntityKind = EntityKind::Container;

    fn key(&self) -> String {
        format!("{}/{}", self.pod_uid, self.name)
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![
            (idx::POD, self.pod_uid.clone()),
            (idx::IMAGE, self.image.clone()),
        ]
    }
}

impl Entity for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        push_opt(&mut out, idx::NAMESPACE, &self.namespace_uid);
        push_opt(&mut out, idx::KIND, &self.kind);
        out
    }
}

impl Entity for HealthCheck {
    const KIND: EntityKind = EntityKind::HealthCheck;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        let healthy = match self.healthy {
            Some(true) => "true",
            Some(false) => "false",
            None => "unknown",
        };
        vec![(idx::HEALTHY, healthy.to_string())]
    }
}

impl Entity for DockerImage {
    const KIND: EntityKind = EntityKind::DockerImage;

    fn key(&self) -> String {
        self.reference()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![
            (idx::REPO, self.repo.clone()),
            (idx::NAME, self.name.clone()),
        ]
    }
}

impl Entity for DockerTag {
    const KIND: EntityKind = EntityKind::DockerTag;

    fn key(&self) -> String {
        format!("{}:{}", self.image, self.name)
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![
            (idx::IMAGE, self.image.clone()),
            (idx::NAME, self.name.clone()),
        ]
    }
}

impl Entity for Report {
    const KIND: EntityKind = EntityKind::Report;

    fn key(&self) -> String {
        self.timestamp.to_string()
    }

    fn index_values(&self) -> Vec<(&'static str, String)> {
        vec![(idx::COMPLETE, self.complete.to_string())]
    }
}
