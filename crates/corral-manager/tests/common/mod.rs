#![allow(dead_code)]

use async_trait::async_trait;
use corral_box::{AdapterSet, RuntimeAdapter};
use corral_core::{ContainerStatus, CorralConfig, CorralError, Result, Sandbox, SandboxRuntimeType};
use corral_manager::{LifecycleController, SandboxRegistry};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure to inject into the next call of an operation.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Unreachable,
    Exhausted,
    Broken,
}

#[derive(Default)]
struct Script {
    containers: HashMap<String, ContainerStatus>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    calls: HashMap<&'static str, usize>,
    unreachable: bool,
    never_ready: bool,
    start_delay: Option<Duration>,
    status_delay: Option<Duration>,
}

/// In-memory runtime whose behaviour tests script up front.
pub struct ScriptedAdapter {
    runtime: SandboxRuntimeType,
    script: Mutex<Script>,
}

impl ScriptedAdapter {
    pub fn new(runtime: SandboxRuntimeType) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            script: Mutex::new(Script::default()),
        })
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.script.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_never_ready(&self, never_ready: bool) {
        self.script.lock().unwrap().never_ready = never_ready;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.script.lock().unwrap().start_delay = Some(delay);
    }

    /// Status queries read the container, then sleep before answering.
    pub fn set_status_delay(&self, delay: Duration) {
        self.script.lock().unwrap().status_delay = Some(delay);
    }

    pub fn fail_next(&self, operation: &'static str, fault: Fault) {
        self.script
            .lock()
            .unwrap()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn container(&self, name: &str) -> Option<ContainerStatus> {
        self.script.lock().unwrap().containers.get(name).copied()
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&self, operation: &'static str, sandbox: &Sandbox) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        *script.calls.entry(operation).or_default() += 1;

        let fault = if script.unreachable {
            Some(Fault::Unreachable)
        } else {
            script.faults.get_mut(operation).and_then(|f| f.pop_front())
        };

        let id = sandbox.id().to_string();
        let runtime = self.runtime;
        match fault {
            None => Ok(()),
            Some(Fault::Unreachable) => Err(CorralError::RuntimeUnavailable {
                runtime,
                id,
                reason: "connection refused".into(),
            }),
            Some(Fault::Exhausted) => Err(CorralError::ResourceExhausted {
                runtime,
                id,
                reason: "port is already allocated".into(),
            }),
            Some(Fault::Broken) => Err(CorralError::Runtime {
                runtime,
                id,
                reason: format!("{} exploded", operation),
            }),
        }
    }

    fn set(&self, sandbox: &Sandbox, status: ContainerStatus) {
        self.script
            .lock()
            .unwrap()
            .containers
            .insert(sandbox.container_name.clone(), status);
    }
}

#[async_trait]
impl RuntimeAdapter for ScriptedAdapter {
    fn runtime_type(&self) -> SandboxRuntimeType {
        self.runtime
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        self.enter("start", sandbox)?;

        let delay = self.script.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.container(&sandbox.container_name) == Some(ContainerStatus::Running) {
            return Err(CorralError::AlreadyRunning {
                id: sandbox.id().to_string(),
            });
        }
        let never_ready = self.script.lock().unwrap().never_ready;
        let status = if never_ready {
            ContainerStatus::Exited
        } else {
            ContainerStatus::Running
        };
        self.set(sandbox, status);
        Ok(())
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        self.enter("stop", sandbox)?;
        if self.container(&sandbox.container_name).is_some() {
            self.set(sandbox, ContainerStatus::Stopped);
        }
        Ok(())
    }

    async fn pause(&self, sandbox: &Sandbox) -> Result<()> {
        self.enter("pause", sandbox)?;
        self.set(sandbox, ContainerStatus::Paused);
        Ok(())
    }

    async fn resume(&self, sandbox: &Sandbox) -> Result<()> {
        self.enter("resume", sandbox)?;
        self.set(sandbox, ContainerStatus::Running);
        Ok(())
    }

    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        self.enter("remove", sandbox)?;
        self.script
            .lock()
            .unwrap()
            .containers
            .remove(&sandbox.container_name);
        Ok(())
    }

    async fn status(&self, sandbox: &Sandbox) -> ContainerStatus {
        let (status, delay) = {
            let script = self.script.lock().unwrap();
            let status = if script.unreachable {
                ContainerStatus::Unknown
            } else {
                script
                    .containers
                    .get(&sandbox.container_name)
                    .copied()
                    .unwrap_or(ContainerStatus::Stopped)
            };
            (status, script.status_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        status
    }

    async fn ping(&self) -> bool {
        !self.script.lock().unwrap().unreachable
    }

    async fn is_enabled(&self, sandbox: &Sandbox) -> bool {
        let script = self.script.lock().unwrap();
        !script.unreachable && script.containers.contains_key(&sandbox.container_name)
    }
}

/// Small port range and quick readiness probing.
pub fn test_config() -> CorralConfig {
    let mut config = CorralConfig::default();
    config.sandbox.port_range_start = 50000;
    config.sandbox.port_range_end = 50009;
    config.readiness.max_probes = 3;
    config.readiness.probe_interval_ms = 100;
    config
}

pub fn controller(adapter: Arc<ScriptedAdapter>) -> LifecycleController {
    controller_with(test_config(), adapter)
}

pub fn controller_with(config: CorralConfig, adapter: Arc<ScriptedAdapter>) -> LifecycleController {
    let adapters = AdapterSet::new().with(adapter);
    LifecycleController::new(&config, adapters, Arc::new(SandboxRegistry::new()))
}
