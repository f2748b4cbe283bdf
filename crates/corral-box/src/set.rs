use corral_core::config::CorralConfig;
use corral_core::{CorralError, Result, SandboxRuntimeType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::blueprint::BlueprintSettings;
use crate::containerd::ContainerdAdapter;
use crate::engine::EngineAdapter;
use crate::traits::RuntimeAdapter;

/// The adapters available to the controller, one per runtime type.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<SandboxRuntimeType, Arc<dyn RuntimeAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`AdapterSet::insert`].
    pub fn with(mut self, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    /// Registers an adapter under its own runtime type, replacing any previous one.
    pub fn insert(&mut self, adapter: Arc<dyn RuntimeAdapter>) {
        self.adapters.insert(adapter.runtime_type(), adapter);
    }

    /// Builds an adapter for every runtime listed in `runtime.enabled`.
    pub fn from_config(config: &CorralConfig) -> Result<Self> {
        let settings = BlueprintSettings::from_config(&config.sandbox);
        let mut set = Self::new();

        for runtime in &config.runtime.enabled {
            if set.contains(*runtime) {
                continue;
            }
            let adapter: Arc<dyn RuntimeAdapter> = match runtime {
                SandboxRuntimeType::Docker => {
                    Arc::new(EngineAdapter::docker(&config.runtime, settings.clone())?)
                }
                SandboxRuntimeType::Podman => {
                    Arc::new(EngineAdapter::podman(&config.runtime, settings.clone())?)
                }
                SandboxRuntimeType::Containerd => {
                    Arc::new(ContainerdAdapter::new(&config.runtime, settings.clone()))
                }
            };
            set.insert(adapter);
        }

        info!("Runtime adapters enabled: {:?}", set.runtimes());
        Ok(set)
    }

    pub fn get(&self, runtime: SandboxRuntimeType) -> Result<Arc<dyn RuntimeAdapter>> {
        self.adapters
            .get(&runtime)
            .cloned()
            .ok_or(CorralError::UnsupportedRuntime(runtime))
    }

    pub fn contains(&self, runtime: SandboxRuntimeType) -> bool {
        self.adapters.contains_key(&runtime)
    }

    /// Configured runtimes in declaration order of [`SandboxRuntimeType::ALL`].
    pub fn runtimes(&self) -> Vec<SandboxRuntimeType> {
        SandboxRuntimeType::ALL
            .iter()
            .copied()
            .filter(|runtime| self.contains(*runtime))
            .collect()
    }
}
