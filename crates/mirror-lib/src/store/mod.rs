//! Durable cache of mirrored cluster state
//!
//! Rows live in memory in one [`Table`] per entity kind and are written to a
//! single JSON snapshot file on every commit. The snapshot is replaced by
//! write-to-temp then rename, so the file on disk is always a committed state.

mod entity;
mod table;

pub use entity::{idx, namespace_state_key};
pub use table::{Entity, Table, Upsert};

use crate::error::{MirrorError, Result};
use crate::models::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// On-disk snapshot format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    nodes: Vec<Node>,
    namespaces: Vec<Namespace>,
    deployments: Vec<Deployment>,
    replica_sets: Vec<ReplicaSet>,
    pods: Vec<Pod>,
    containers: Vec<Container>,
    events: Vec<Event>,
    health_checks: Vec<HealthCheck>,
    docker_images: Vec<DockerImage>,
    docker_tags: Vec<DockerTag>,
    reports: Vec<Report>,
    latest_report: Option<i64>,
}

/// The cache store
pub struct Store {
    nodes: Table<Node>,
    namespaces: Table<Namespace>,
    deployments: Table<Deployment>,
    replica_sets: Table<ReplicaSet>,
    pods: Table<Pod>,
    containers: Table<Container>,
    events: Table<Event>,
    health_checks: Table<HealthCheck>,
    docker_images: Table<DockerImage>,
    docker_tags: Table<DockerTag>,
    reports: Table<Report>,
    latest_report: RwLock<Option<i64>>,
    path: Option<PathBuf>,
    persist_guard: Mutex<()>,
}

impl Default for Store {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Store {
    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self::from_snapshot(Snapshot::default(), None)
    }

    /// Open the store at `path`, loading an existing snapshot if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let snapshot = if path.exists() {
            match Self::load_from_disk(&path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load store snapshot, starting fresh");
                    Snapshot::default()
                }
            }
        } else {
            Snapshot::default()
        };

        let store = Self::from_snapshot(snapshot, Some(path.clone()));
        info!(
            path = %path.display(),
            nodes = store.nodes.len(),
            pods = store.pods.len(),
            reports = store.reports.len(),
            "Store opened"
        );
        Ok(store)
    }

    fn from_snapshot(snapshot: Snapshot, path: Option<PathBuf>) -> Self {
        Self {
            nodes: Table::from_rows(snapshot.nodes),
            namespaces: Table::from_rows(snapshot.namespaces),
            deployments: Table::from_rows(snapshot.deployments),
            replica_sets: Table::from_rows(snapshot.replica_sets),
            pods: Table::from_rows(snapshot.pods),
            containers: Table::from_rows(snapshot.containers),
            events: Table::from_rows(snapshot.events),
            health_checks: Table::from_rows(snapshot.health_checks),
            docker_images: Table::from_rows(snapshot.docker_images),
            docker_tags: Table::from_rows(snapshot.docker_tags),
            reports: Table::from_rows(snapshot.reports),
            latest_report: RwLock::new(snapshot.latest_report),
            path,
            persist_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn nodes(&self) -> &Table<Node> {
        &self.nodes
    }

    pub fn namespaces(&self) -> &Table<Namespace> {
        &self.namespaces
    }

    pub fn deployments(&self) -> &Table<Deployment> {
        &self.deployments
    }

    pub fn replica_sets(&self) -> &Table<ReplicaSet> {
        &self.replica_sets
    }

    pub fn pods(&self) -> &Table<Pod> {
        &self.pods
    }

    pub fn containers(&self) -> &Table<Container> {
        &self.containers
    }

    pub fn events(&self) -> &Table<Event> {
        &self.events
    }

    pub fn health_checks(&self) -> &Table<HealthCheck> {
        &self.health_checks
    }

    pub fn docker_images(&self) -> &Table<DockerImage> {
        &self.docker_images
    }

    pub fn docker_tags(&self) -> &Table<DockerTag> {
        &self.docker_tags
    }

    pub fn reports(&self) -> &Table<Report> {
        &self.reports
    }

    /// Timestamp of the report the "latest" pointer references
    pub fn latest_report(&self) -> Option<i64> {
        *self
            .latest_report
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_latest_report(&self, timestamp: Option<i64>) {
        *self
            .latest_report
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timestamp;
    }

    /// Delete a pod together with its containers
    pub fn delete_pod(&self, uid: &str) -> Option<Pod> {
        let pod = self.pods.delete(uid)?;
        for container in self.containers.find_by(idx::POD, uid) {
            self.containers.delete(&container.key());
        }
        Some(pod)
    }

    /// Delete an image together with its tags
    pub fn delete_docker_image(&self, reference: &str) -> Option<DockerImage> {
        let image = self.docker_images.delete(reference)?;
        for tag in self.docker_tags.find_by(idx::IMAGE, reference) {
            self.docker_tags.delete(&tag.key());
        }
        Some(image)
    }

    /// Containers of a pod
    pub fn pod_containers(&self, pod_uid: &str) -> Vec<Container> {
        self.containers.find_by(idx::POD, pod_uid)
    }

    /// Requests and limits summed over a pod's containers
    pub fn pod_resources(&self, pod_uid: &str) -> ResourceTotals {
        ResourceTotals::of(&self.pod_containers(pod_uid))
    }

    /// One resource summed over every pod scheduled on a node
    pub fn node_resource(&self, node: &str, resource: Resource) -> f64 {
        self.pods
            .find_by(idx::NODE, node)
            .iter()
            .map(|pod| resource.sum(&self.pod_containers(&pod.uid)))
            .sum()
    }

    /// Pods of a namespace in a given lifecycle phase
    pub fn pods_in_state(&self, namespace: &str, state: &str) -> Vec<Pod> {
        self.pods
            .find_by(idx::NAMESPACE_STATE, &namespace_state_key(namespace, state))
    }

    /// Pods whose phase is neither Running nor Succeeded
    pub fn unhealthy_pods(&self) -> Vec<Pod> {
        self.pods.find_by(idx::HEALTHY, "false")
    }

    pub fn namespace_by_name(&self, name: &str) -> Option<Namespace> {
        self.namespaces.find_by(idx::NAME, name).into_iter().next()
    }

    /// Namespaces belonging to an app
    pub fn app_namespaces(&self, app: &str) -> Vec<Namespace> {
        let mut namespaces = self.namespaces.find_by(idx::APP, app);
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        namespaces
    }

    /// Namespaces with no derivable app
    pub fn orphan_namespaces(&self) -> Vec<Namespace> {
        self.namespaces.find(|ns| ns.app.is_none())
    }

    pub fn namespace_deployments(&self, namespace_uid: &str) -> Vec<Deployment> {
        self.deployments.find_by(idx::NAMESPACE, namespace_uid)
    }

    /// Distinct app names, sorted
    pub fn apps(&self) -> Vec<String> {
        self.namespaces
            .all()
            .into_iter()
            .filter_map(|ns| ns.app)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Row count per kind
    pub fn counts(&self) -> Vec<(EntityKind, usize)> {
        vec![
            (EntityKind::Node, self.nodes.len()),
            (EntityKind::Namespace, self.namespaces.len()),
            (EntityKind::Deployment, self.deployments.len()),
            (EntityKind::ReplicaSet, self.replica_sets.len()),
            (EntityKind::Pod, self.pods.len()),
            (EntityKind::Container, self.containers.len()),
            (EntityKind::Event, self.events.len()),
            (EntityKind::HealthCheck, self.health_checks.len()),
            (EntityKind::DockerImage, self.docker_images.len()),
            (EntityKind::DockerTag, self.docker_tags.len()),
            (EntityKind::Report, self.reports.len()),
        ]
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            nodes: self.nodes.all(),
            namespaces: self.namespaces.all(),
            deployments: self.deployments.all(),
            replica_sets: self.replica_sets.all(),
            pods: self.pods.all(),
            containers: self.containers.all(),
            events: self.events.all(),
            health_checks: self.health_checks.all(),
            docker_images: self.docker_images.all(),
            docker_tags: self.docker_tags.all(),
            reports: self.reports.all(),
            latest_report: self.latest_report(),
        }
    }

    /// Commit the current state to disk; a no-op for in-memory stores
    pub fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        let _guard = self
            .persist_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let snapshot = self.snapshot();
        Self::save_to_disk(path, &snapshot).map_err(|e| MirrorError::Store {
            path: path.clone(),
            message: e.to_string(),
        })?;

        debug!(path = %path.display(), "Store persisted");
        Ok(())
    }

    fn save_to_disk(path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec(snapshot)?;

        // Write atomically using temp file
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;

        std::fs::rename(&temp_path, path)
    }

    fn load_from_disk(path: &Path) -> std::io::Result<Snapshot> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pod(uid: &str, namespace: &str, state: &str) -> Pod {
        Pod {
            uid: uid.to_string(),
            name: format!("pod-{}", uid),
            created_at: None,
            namespace_uid: Some(format!("ns-{}", namespace)),
            namespace: namespace.to_string(),
            deployment_uid: None,
            node_name: Some("node-a".to_string()),
            annotations: StringMap::new(),
            labels: StringMap::new(),
            state: state.to_string(),
            scheduled: None,
            initialized: None,
            ready: None,
            containers_ready: None,
            restarts: 0,
            ready_count: "0/1".to_string(),
            orphan: true,
        }
    }

    fn container(pod_uid: &str, name: &str) -> Container {
        Container {
            pod_uid: pod_uid.to_string(),
            name: name.to_string(),
            image: "nginx:1.25".to_string(),
            liveness_probe: None,
            readiness_probe: None,
            cpu_requests: 0.1,
            cpu_limits: 0.2,
            ram_requests: 64.0,
            ram_limits: 128.0,
        }
    }

    #[test]
    fn test_pod_indexes() {
        let store = Store::in_memory();
        store.pods().upsert(pod("1", "shop-prod", "Running"));
        store.pods().upsert(pod("2", "shop-prod", "Pending"));
        store.pods().upsert(pod("3", "shop-perf", "Pending"));

        assert_eq!(store.pods_in_state("shop-prod", "Pending").len(), 1);
        assert_eq!(store.unhealthy_pods().len(), 2);
        assert_eq!(store.pods().find_by(idx::NODE, "node-a").len(), 3);
    }

    #[test]
    fn test_delete_pod_cascades_to_containers() {
        let store = Store::in_memory();
        store.pods().upsert(pod("1", "shop-prod", "Running"));
        store.containers().upsert(container("1", "web"));
        store.containers().upsert(container("1", "sidecar"));
        store.containers().upsert(container("2", "web"));

        store.delete_pod("1");

        assert!(store.pod_containers("1").is_empty());
        assert_eq!(store.containers().len(), 1);
    }

    #[test]
    fn test_resource_sums() {
        let store = Store::in_memory();
        store.pods().upsert(pod("1", "shop-prod", "Running"));
        store.pods().upsert(pod("2", "shop-prod", "Running"));
        store.containers().upsert(container("1", "web"));
        store.containers().upsert(container("1", "sidecar"));
        store.containers().upsert(container("2", "web"));

        let totals = store.pod_resources("1");
        assert_eq!(totals.ram_requests, 128.0);
        assert_eq!(totals.ram_limits, 256.0);
        assert_eq!(store.node_resource("node-a", Resource::RamLimits), 384.0);
        assert_eq!(store.node_resource("node-b", Resource::CpuRequests), 0.0);
    }

    #[test]
    fn test_delete_image_cascades_to_tags() {
        let store = Store::in_memory();
        let image = DockerImage {
            repo: "prod".to_string(),
            name: "web".to_string(),
        };
        store.docker_images().upsert(image.clone());
        for tag in ["1.0", "1.1"] {
            store.docker_tags().upsert(DockerTag {
                image: image.reference(),
                name: tag.to_string(),
                labels: StringMap::new(),
            });
        }

        store.delete_docker_image(&image.reference());

        assert!(store.docker_images().is_empty());
        assert!(store.docker_tags().is_empty());
    }

    #[test]
    fn test_persist_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");

        {
            let store = Store::open(&path).unwrap();
            store.pods().upsert(pod("1", "shop-prod", "Running"));
            store.reports().upsert(Report::pending(100));
            store.set_latest_report(Some(100));
            store.persist().unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.pods().len(), 1);
        assert_eq!(reopened.latest_report(), Some(100));
        assert!(reopened.reports().find_one("100").is_some());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = Store::open(&path).unwrap();
        assert!(store.pods().is_empty());
    }

    #[test]
    fn test_apps_are_distinct_and_sorted() {
        let store = Store::in_memory();
        for (uid, name) in [("1", "shop-prod"), ("2", "shop-perf"), ("3", "billing-prod"), ("4", "kube-system")] {
            store.namespaces().upsert(Namespace::new(
                uid.to_string(),
                name.to_string(),
                StringMap::new(),
                StringMap::new(),
            ));
        }

        assert_eq!(store.apps(), vec!["billing", "shop"]);
        assert_eq!(store.app_namespaces("shop").len(), 2);
        assert_eq!(store.orphan_namespaces()[0].name, "kube-system");
    }
}
