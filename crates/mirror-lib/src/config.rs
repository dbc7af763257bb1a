//! Mirror settings
//!
//! Loaded from an optional settings file layered under `MIRROR__*`
//! environment variables. Every field has a default so an empty
//! environment yields a usable in-cluster configuration.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MirrorError, Result};

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "MIRROR_CONFIG";

/// Settings file used when `MIRROR_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";

/// Service-account directory inside a pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Root prepended to the service-account directory when running under a proxy
pub const SECRETS_ROOT_ENV: &str = "TELEPRESENCE_ROOT";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `production` or `development`
    #[serde(default = "default_env")]
    pub env: String,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub prometheus: PrometheusSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub reports: ReportSettings,

    /// Health checks by name
    #[serde(default)]
    pub checks: BTreeMap<String, CheckDefinition>,

    #[serde(default)]
    pub api: ApiSettings,

    /// Decimal places kept when converting CPU quantities
    #[serde(default = "default_precision")]
    pub precision: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: default_env(),
            worker: WorkerSettings::default(),
            cluster: ClusterSettings::default(),
            prometheus: PrometheusSettings::default(),
            registry: RegistrySettings::default(),
            reports: ReportSettings::default(),
            checks: BTreeMap::new(),
            api: ApiSettings::default(),
            precision: default_precision(),
        }
    }
}

fn default_env() -> String {
    "production".to_string()
}

fn default_precision() -> u32 {
    crate::quantity::DEFAULT_PRECISION
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Seconds slept between cycles
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            sleep_secs: default_sleep_secs(),
            lock_file: default_lock_file(),
            store_path: default_store_path(),
        }
    }
}

fn default_sleep_secs() -> u64 {
    300
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("cluster-mirror.pid")
}

fn default_store_path() -> PathBuf {
    std::env::temp_dir().join("cluster-mirror.json")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_cluster_url")]
    pub url: String,

    /// Directory holding `token` and `ca.crt`
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,

    #[serde(default = "default_cluster_timeout")]
    pub timeout_secs: u64,

    /// Label selector applied when listing nodes
    #[serde(default = "default_node_selector")]
    pub node_selector: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            url: default_cluster_url(),
            secrets_dir: None,
            timeout_secs: default_cluster_timeout(),
            node_selector: default_node_selector(),
        }
    }
}

impl ClusterSettings {
    /// Service-account directory, honouring `TELEPRESENCE_ROOT`
    pub fn secrets_dir(&self) -> PathBuf {
        if let Some(dir) = &self.secrets_dir {
            return dir.clone();
        }
        match std::env::var(SECRETS_ROOT_ENV) {
            Ok(root) if !root.is_empty() => {
                Path::new(&root).join(SERVICE_ACCOUNT_DIR.trim_start_matches('/'))
            }
            _ => PathBuf::from(SERVICE_ACCOUNT_DIR),
        }
    }

    pub fn token_path(&self) -> PathBuf {
        self.secrets_dir().join("token")
    }

    pub fn ca_path(&self) -> PathBuf {
        self.secrets_dir().join("ca.crt")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_cluster_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_cluster_timeout() -> u64 {
    30
}

fn default_node_selector() -> String {
    "!node-role.kubernetes.io/master".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusSettings {
    #[serde(default = "default_prometheus_url")]
    pub url: String,

    #[serde(default = "default_prometheus_timeout")]
    pub timeout_secs: u64,
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self {
            url: default_prometheus_url(),
            timeout_secs: default_prometheus_timeout(),
        }
    }
}

fn default_prometheus_url() -> String {
    "http://prometheus-operated.monitoring.svc:9090".to_string()
}

fn default_prometheus_timeout() -> u64 {
    45
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    /// Registry base URL per tier
    #[serde(default)]
    pub tiers: BTreeMap<String, String>,

    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            tiers: BTreeMap::new(),
            timeout_secs: default_registry_timeout(),
        }
    }
}

fn default_registry_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSettings {
    /// Minimum seconds between completed reports
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_report_interval(),
            retention_days: default_retention_days(),
        }
    }
}

impl ReportSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

fn default_report_interval() -> u64 {
    24 * 60 * 60
}

fn default_retention_days() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// How a health check's response is turned into a result string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    #[default]
    ResponseCode,
    Json,
}

/// A health check as written in settings: a bare URL or a full table
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CheckDefinition {
    Uri(String),
    Full(CheckSpec),
}

impl CheckDefinition {
    pub fn spec(&self) -> CheckSpec {
        match self {
            CheckDefinition::Uri(uri) => CheckSpec {
                uri: uri.clone(),
                ..CheckSpec::default()
            },
            CheckDefinition::Full(spec) => spec.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckSpec {
    pub uri: String,

    #[serde(default, rename = "type")]
    pub check_type: CheckType,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Status code -> message overrides for response-code checks
    #[serde(default)]
    pub response_codes: BTreeMap<String, String>,

    /// Dotted path of the field extracted by JSON checks
    #[serde(default)]
    pub value: Option<String>,

    /// Value the extracted field must equal to count as healthy
    #[serde(default)]
    pub expected: Option<String>,

    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

impl Default for CheckSpec {
    fn default() -> Self {
        Self {
            uri: String::new(),
            check_type: CheckType::default(),
            headers: BTreeMap::new(),
            response_codes: BTreeMap::new(),
            value: None,
            expected: None,
            timeout_secs: default_check_timeout(),
        }
    }
}

fn default_check_timeout() -> u64 {
    5
}

impl Settings {
    /// Load from the file named by `MIRROR_CONFIG` (or the default path)
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file, layered under `MIRROR__*` variables
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("MIRROR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.sleep_secs == 0 {
            return Err(MirrorError::Config(config::ConfigError::Message(
                "worker.sleep_secs must be positive".to_string(),
            )));
        }
        for (name, definition) in &self.checks {
            let spec = definition.spec();
            if url::Url::parse(&spec.uri).is_err() {
                return Err(MirrorError::Config(config::ConfigError::Message(format!(
                    "check {} has invalid uri {:?}",
                    name, spec.uri
                ))));
            }
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.env == "development"
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.worker.sleep_secs)
    }
}
