use corral_core::config::{ImageConfig, SandboxConfig};
use corral_core::{PortMapping, Sandbox};
use std::collections::BTreeMap;

pub const LABEL_ID: &str = "corral.sandbox.id";
pub const LABEL_KIND: &str = "corral.sandbox.kind";
pub const LABEL_NAME: &str = "corral.sandbox.name";

/// Runtime-neutral description of the container backing a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBlueprint {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Image selection and mount layout shared by every adapter.
#[derive(Debug, Clone)]
pub struct BlueprintSettings {
    pub images: ImageConfig,
    pub workspace_dir: String,
}

impl BlueprintSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            images: config.images.clone(),
            workspace_dir: config.workspace_dir.clone(),
        }
    }

    pub fn blueprint(&self, sandbox: &Sandbox) -> ContainerBlueprint {
        let env = sandbox
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let binds = sandbox
            .mount_dir
            .iter()
            .map(|dir| format!("{}:{}", dir.display(), self.workspace_dir))
            .collect();

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_ID.to_string(), sandbox.id().to_string());
        labels.insert(LABEL_KIND.to_string(), sandbox.kind.to_string());
        labels.insert(LABEL_NAME.to_string(), sandbox.name.clone());

        ContainerBlueprint {
            name: sandbox.container_name.clone(),
            image: self.images.for_kind(sandbox.kind).to_string(),
            env,
            ports: sandbox.ports.clone(),
            binds,
            labels,
        }
    }
}

impl Default for BlueprintSettings {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}
