use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CorralError;

/// What a sandbox is for. Each kind maps to its own image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Base,
    #[serde(alias = "fs")]
    Filesystem,
    Browser,
}

impl SandboxKind {
    /// Ports the sandbox image listens on inside the container.
    ///
    /// 8000 is the sandbox API; browser sandboxes also expose the remote
    /// browser on 8080.
    pub fn container_ports(&self) -> &'static [u16] {
        match self {
            SandboxKind::Browser => &[8000, 8080],
            SandboxKind::Base | SandboxKind::Filesystem => &[8000],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Base => "base",
            SandboxKind::Filesystem => "filesystem",
            SandboxKind::Browser => "browser",
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxKind {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(SandboxKind::Base),
            "filesystem" | "fs" => Ok(SandboxKind::Filesystem),
            "browser" => Ok(SandboxKind::Browser),
            other => Err(CorralError::InvalidArgument(format!(
                "unknown sandbox kind: {}",
                other
            ))),
        }
    }
}

/// Container runtime backing a sandbox. Fixed when the sandbox is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntimeType {
    Containerd,
    Podman,
    Docker,
}

impl SandboxRuntimeType {
    pub const ALL: [SandboxRuntimeType; 3] = [
        SandboxRuntimeType::Containerd,
        SandboxRuntimeType::Podman,
        SandboxRuntimeType::Docker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxRuntimeType::Containerd => "containerd",
            SandboxRuntimeType::Podman => "podman",
            SandboxRuntimeType::Docker => "docker",
        }
    }
}

impl fmt::Display for SandboxRuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxRuntimeType {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "containerd" => Ok(SandboxRuntimeType::Containerd),
            "podman" => Ok(SandboxRuntimeType::Podman),
            "docker" => Ok(SandboxRuntimeType::Docker),
            other => Err(CorralError::InvalidArgument(format!(
                "unknown runtime type: {}",
                other
            ))),
        }
    }
}

/// Container status as reported by a runtime, normalized across runtimes.
///
/// `Unknown` means the runtime could not be asked or gave an answer we do not
/// understand. It is never folded into `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Paused,
    Exited,
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// Map a Docker-style `State.Status` string (Docker, Podman and nerdctl
    /// all report these) onto the normalized enum.
    pub fn from_engine_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Stopped,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "exited" | "dead" => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "paused" => Ok(ContainerStatus::Paused),
            "exited" => Ok(ContainerStatus::Exited),
            "unknown" => Ok(ContainerStatus::Unknown),
            other => Err(CorralError::InvalidArgument(format!(
                "unknown container status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state owned by the controller.
///
/// ```text
///   Created ──▶ Starting ──▶ Running ◀──▶ Paused
///      ▲           │            │           │
///      │           ▼            ▼           │
///      │        Failed ◀──── Stopping ◀─────┘
///      │           │            │
///      └── reset ──┘            ▼
///                            Stopped ──▶ Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// States only observable while an operation holds the sandbox lock.
    pub fn is_transient(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Paused => "PAUSED",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(LifecycleState::Created),
            "STARTING" => Ok(LifecycleState::Starting),
            "RUNNING" => Ok(LifecycleState::Running),
            "PAUSED" => Ok(LifecycleState::Paused),
            "STOPPING" => Ok(LifecycleState::Stopping),
            "STOPPED" => Ok(LifecycleState::Stopped),
            "FAILED" => Ok(LifecycleState::Failed),
            other => Err(CorralError::InvalidArgument(format!(
                "unknown lifecycle state: {}",
                other
            ))),
        }
    }
}

/// Host port published for a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    id: String,
    pub name: String,
    pub kind: SandboxKind,
    pub runtime: SandboxRuntimeType,
    pub status: ContainerStatus,
    pub state: LifecycleState,
    pub container_name: String,
    pub ports: Vec<PortMapping>,
    pub base_url: Option<String>,
    pub browser_url: Option<String>,
    pub runtime_token: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub mount_dir: Option<PathBuf>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    /// A fresh record in `Created`. The container name defaults to the id.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: SandboxKind,
        runtime: SandboxRuntimeType,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            container_name: id.clone(),
            id,
            name: name.into(),
            kind,
            runtime,
            status: ContainerStatus::Stopped,
            state: LifecycleState::Created,
            ports: Vec::new(),
            base_url: None,
            browser_url: None,
            runtime_token: None,
            environment: BTreeMap::new(),
            mount_dir: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.ports.iter().map(|p| p.host).collect()
    }

    /// Host port published for the given container port, if any.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container == container_port)
            .map(|p| p.host)
    }
}

/// Which tool inside the sandbox runs the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Python,
    Shell,
}

impl ExecutionKind {
    /// Path of the tool endpoint on the in-sandbox server.
    pub fn tool_path(&self) -> &'static str {
        match self {
            ExecutionKind::Python => "/tools/run_ipython_cell",
            ExecutionKind::Shell => "/tools/run_shell_command",
        }
    }

    /// Body field the tool reads the source from.
    pub fn source_field(&self) -> &'static str {
        match self {
            ExecutionKind::Python => "code",
            ExecutionKind::Shell => "command",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Python => write!(f, "python"),
            ExecutionKind::Shell => write!(f, "shell"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What the sandbox's tool server returns for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub content: Vec<TextContent>,
    #[serde(default)]
    pub is_error: bool,
}

/// Provisioning request. Everything is optional and falls back to the
/// configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<SandboxKind>,
    pub runtime: Option<SandboxRuntimeType>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFilter {
    pub kind: Option<SandboxKind>,
    pub runtime: Option<SandboxRuntimeType>,
    pub state: Option<LifecycleState>,
    pub status: Option<ContainerStatus>,
}

impl SandboxFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, sandbox: &Sandbox) -> bool {
        self.kind.map_or(true, |k| k == sandbox.kind)
            && self.runtime.map_or(true, |r| r == sandbox.runtime)
            && self.state.map_or(true, |s| s == sandbox.state)
            && self.status.map_or(true, |s| s == sandbox.status)
    }
}
