use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::models::{SandboxKind, SandboxRuntimeType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
    pub readiness: ReadinessConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Bearer token required on every non-health route. Unset means open.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "INFO".to_string(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub default_kind: SandboxKind,
    pub default_runtime: SandboxRuntimeType,
    pub container_prefix: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Workspace path inside the container.
    pub workspace_dir: String,
    /// Host directory under which each sandbox gets `<mount_root>/<id>`
    /// bound to `workspace_dir`.
    pub mount_root: Option<String>,
    /// Extra `KEY=value` entries injected into every sandbox.
    pub environment: Vec<String>,
    pub images: ImageConfig,
    /// Upper bound on one proxied python or shell execution.
    pub execution_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_kind: SandboxKind::Base,
            default_runtime: SandboxRuntimeType::Docker,
            container_prefix: "sandbox-".to_string(),
            port_range_start: 49152,
            port_range_end: 59152,
            workspace_dir: "/workspace".to_string(),
            mount_root: None,
            environment: Vec::new(),
            images: ImageConfig::default(),
            execution_timeout_secs: 60,
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// `environment` as a map. Entries without `=` are dropped with a warning.
    pub fn environment_map(&self) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
                _ => {
                    tracing::warn!("Ignoring malformed sandbox environment entry: {}", entry);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub base: String,
    pub filesystem: String,
    pub browser: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base: "agentruntime/sandbox:base".to_string(),
            filesystem: "agentruntime/sandbox:filesystem".to_string(),
            browser: "agentruntime/sandbox:browser".to_string(),
        }
    }
}

impl ImageConfig {
    pub fn for_kind(&self, kind: SandboxKind) -> &str {
        match kind {
            SandboxKind::Base => &self.base,
            SandboxKind::Filesystem => &self.filesystem,
            SandboxKind::Browser => &self.browser,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtimes to build adapters for at startup.
    pub enabled: Vec<SandboxRuntimeType>,
    pub docker_host: String,
    pub podman_host: String,
    pub nerdctl_path: String,
    pub containerd_address: Option<String>,
    pub containerd_namespace: String,
    pub request_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: vec![SandboxRuntimeType::Docker],
            docker_host: "unix:///var/run/docker.sock".to_string(),
            podman_host: "unix:///run/podman/podman.sock".to_string(),
            nerdctl_path: "nerdctl".to_string(),
            containerd_address: None,
            containerd_namespace: "corral".to_string(),
            request_timeout_secs: 45,
            stop_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_probes: u32,
    pub probe_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_probes: 30,
            probe_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Stop running sandboxes when the server exits. Records stay registered.
    pub stop_running: bool,
}

impl CorralConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::load(config::File::with_name("corral").required(false))
    }

    /// Load from an explicit file, still letting `CORRAL__*` variables win.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        Self::load(config::File::from(path.as_ref()).required(true))
    }

    fn load<S>(file: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let builder = config::Config::builder()
            // Defaults come from the serde(default) impls above
            .add_source(file)
            // CORRAL__SANDBOX__PORT_RANGE_START=50000
            .add_source(
                config::Environment::with_prefix("CORRAL")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runtime.enabled")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
