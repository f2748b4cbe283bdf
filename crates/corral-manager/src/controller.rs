use corral_box::{AdapterSet, RuntimeAdapter, SandboxClient};
use corral_core::config::{CorralConfig, SandboxConfig};
use corral_core::{
    ContainerStatus, CorralError, ExecutionKind, ExecutionResult, LifecycleState, PortMapping,
    Result, Sandbox, SandboxFilter, SandboxRequest, SandboxRuntimeType,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::lifecycle::{self, Operation, Plan};
use crate::ports::PortAllocator;
use crate::registry::{SandboxRegistry, SandboxSlot};
use crate::retry::{ReadinessPolicy, RetryPolicy};

const BASE_PORT: u16 = 8000;
const BROWSER_PORT: u16 = 8080;

/// Drives sandboxes through their lifecycle on whichever runtime each one
/// was provisioned for.
///
/// Lifecycle operations on one sandbox are serialized by its registry slot;
/// different sandboxes never wait on each other. Every operation that talks
/// to a runtime takes a [`CancellationToken`].
pub struct LifecycleController {
    registry: Arc<SandboxRegistry>,
    adapters: AdapterSet,
    ports: PortAllocator,
    sandbox: SandboxConfig,
    retry: RetryPolicy,
    readiness: ReadinessPolicy,
    client: SandboxClient,
}

impl LifecycleController {
    pub fn new(config: &CorralConfig, adapters: AdapterSet, registry: Arc<SandboxRegistry>) -> Self {
        Self {
            registry,
            adapters,
            ports: PortAllocator::new(
                config.sandbox.port_range_start,
                config.sandbox.port_range_end,
            ),
            sandbox: config.sandbox.clone(),
            retry: RetryPolicy::from(&config.retry),
            readiness: ReadinessPolicy::from(&config.readiness),
            client: SandboxClient::new(config.sandbox.execution_timeout()),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn runtimes(&self) -> Vec<SandboxRuntimeType> {
        self.adapters.runtimes()
    }

    /// Build a sandbox record from `request` and register it in `Created`.
    ///
    /// Host ports are taken from the configured range, one per container port
    /// the kind exposes. Nothing is created on the runtime until `start`.
    #[instrument(skip(self, request))]
    pub fn provision(&self, request: SandboxRequest) -> Result<Sandbox> {
        let runtime = request.runtime.unwrap_or(self.sandbox.default_runtime);
        if !self.adapters.contains(runtime) {
            return Err(CorralError::UnsupportedRuntime(runtime));
        }

        let id = match request.id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        if self.registry.contains(&id) {
            return Err(CorralError::DuplicateIdentity(id));
        }

        let kind = request.kind.unwrap_or(self.sandbox.default_kind);
        let name = request
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{}{}", self.sandbox.container_prefix, id));

        let container_ports = kind.container_ports();
        let host_ports = self.ports.allocate(container_ports.len())?;

        let mut sandbox = Sandbox::new(id.clone(), name, kind, runtime);
        sandbox.container_name = format!("{}{}", self.sandbox.container_prefix, id);
        sandbox.ports = container_ports
            .iter()
            .zip(&host_ports)
            .map(|(container, host)| PortMapping {
                host: *host,
                container: *container,
            })
            .collect();
        sandbox.base_url = sandbox
            .host_port_for(BASE_PORT)
            .map(|port| format!("http://localhost:{}", port));
        sandbox.browser_url = sandbox
            .host_port_for(BROWSER_PORT)
            .map(|port| format!("http://localhost:{}", port));
        sandbox.runtime_token = Some(Uuid::new_v4().simple().to_string());
        sandbox.mount_dir = self
            .sandbox
            .mount_root
            .as_ref()
            .map(|root| PathBuf::from(root).join(&id));

        sandbox.environment = self.sandbox.environment_map();
        sandbox.environment.extend(request.environment);
        sandbox
            .environment
            .insert("SESSION_ID".to_string(), id.clone());
        sandbox
            .environment
            .insert("WORKSPACE_DIR".to_string(), self.sandbox.workspace_dir.clone());
        if let Some(token) = &sandbox.runtime_token {
            sandbox
                .environment
                .insert("SECRET_TOKEN".to_string(), token.clone());
        }

        if let Err(e) = self.registry.register(sandbox.clone()) {
            self.ports.release(&host_ports);
            return Err(e);
        }

        info!(
            "Provisioned {} sandbox {} on {} (ports {:?})",
            kind,
            id,
            runtime,
            host_ports
        );
        Ok(sandbox)
    }

    /// Register a record built elsewhere. Its host ports are reserved.
    pub fn register(&self, sandbox: Sandbox) -> Result<()> {
        let ports = sandbox.host_ports();
        self.registry.register(sandbox)?;
        self.ports.reserve(&ports);
        Ok(())
    }

    pub async fn start(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Start).await
    }

    pub async fn stop(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Stop).await
    }

    pub async fn pause(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Pause).await
    }

    pub async fn resume(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Resume).await
    }

    /// Bring a Failed sandbox back to Created, stopping its container first.
    pub async fn reset(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Reset).await
    }

    /// Remove the container and forget the sandbox. Returns the final record.
    pub async fn deregister(&self, cancel: &CancellationToken, id: &str) -> Result<Sandbox> {
        self.transition(cancel, id, Operation::Deregister).await
    }

    /// True only when the sandbox is Running and its container says so.
    pub async fn is_running(&self, cancel: &CancellationToken, id: &str) -> Result<bool> {
        let sandbox = self.describe(id)?;
        if sandbox.state != LifecycleState::Running {
            return Ok(false);
        }
        let status = self.observe(cancel, &sandbox).await?;
        Ok(status == ContainerStatus::Running)
    }

    pub async fn is_enabled(&self, cancel: &CancellationToken, id: &str) -> Result<bool> {
        let sandbox = self.describe(id)?;
        let Ok(adapter) = self.adapters.get(sandbox.runtime) else {
            return Ok(false);
        };
        race(cancel, id, "query", async {
            Ok(adapter.is_enabled(&sandbox).await)
        })
        .await
    }

    /// Container status as the runtime reports it right now.
    ///
    /// While a start is in flight the recorded status is returned instead, so
    /// a sandbox never looks running before its start completes.
    pub async fn status(&self, cancel: &CancellationToken, id: &str) -> Result<ContainerStatus> {
        let sandbox = self.describe(id)?;
        if sandbox.state == LifecycleState::Starting {
            return Ok(sandbox.status);
        }
        self.observe(cancel, &sandbox).await
    }

    /// Run python or shell source through the tool server of a Running
    /// sandbox. Does not take the lifecycle lock.
    #[instrument(skip(self, cancel, source))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        id: &str,
        kind: ExecutionKind,
        source: &str,
        split_output: bool,
    ) -> Result<ExecutionResult> {
        let sandbox = self.describe(id)?;
        if sandbox.state != LifecycleState::Running {
            return Err(CorralError::InvalidTransition {
                id: id.to_string(),
                state: sandbox.state,
                operation: "execute",
            });
        }

        let result = race(
            cancel,
            id,
            "execute",
            self.client.execute(&sandbox, kind, source, split_output),
        )
        .await?;
        if result.is_error {
            debug!("{} execution in sandbox {} reported an error", kind, id);
        }
        Ok(result)
    }

    pub fn sandbox_type(&self, id: &str) -> Result<SandboxRuntimeType> {
        self.describe(id).map(|sandbox| sandbox.runtime)
    }

    pub fn describe(&self, id: &str) -> Result<Sandbox> {
        self.registry
            .lookup(id)
            .ok_or_else(|| CorralError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &SandboxFilter) -> Vec<Sandbox> {
        self.registry.list(filter)
    }

    /// Stop every Running or Paused sandbox. Records stay registered.
    /// Returns how many were stopped; failures are logged.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> usize {
        let active: Vec<Sandbox> = self
            .registry
            .list(&SandboxFilter::all())
            .into_iter()
            .filter(|sb| matches!(sb.state, LifecycleState::Running | LifecycleState::Paused))
            .collect();

        info!("Stopping {} active sandboxes", active.len());
        let mut stopped = 0;
        for sandbox in active {
            if cancel.is_cancelled() {
                warn!("Stop-all cancelled after {} sandboxes", stopped);
                break;
            }
            match self.stop(cancel, sandbox.id()).await {
                Ok(_) => stopped += 1,
                Err(e) => error!("Failed to stop sandbox {}: {}", sandbox.id(), e),
            }
        }
        stopped
    }

    /// Ask the runtime for the container status, writing it back while the
    /// sandbox is settled in Running or Paused.
    async fn observe(&self, cancel: &CancellationToken, sandbox: &Sandbox) -> Result<ContainerStatus> {
        let Ok(adapter) = self.adapters.get(sandbox.runtime) else {
            return Ok(ContainerStatus::Unknown);
        };
        let status = race(cancel, sandbox.id(), "query", async {
            Ok(adapter.status(sandbox).await)
        })
        .await?;

        // Skip the write-back if a transition landed while we were asking.
        if let Ok(slot) = self.registry.slot(sandbox.id()) {
            let current = slot.snapshot();
            if is_unchanged(&current, sandbox)
                && matches!(current.state, LifecycleState::Running | LifecycleState::Paused)
                && current.status != status
            {
                debug!("Sandbox {} status {} -> {}", sandbox.id(), current.status, status);
                slot.update(|sb| {
                    if is_unchanged(sb, sandbox) {
                        sb.status = status;
                    }
                });
            }
        }
        Ok(status)
    }

    #[instrument(skip(self, cancel, operation), fields(operation = operation.as_str()))]
    async fn transition(
        &self,
        cancel: &CancellationToken,
        id: &str,
        operation: Operation,
    ) -> Result<Sandbox> {
        let slot = self.registry.slot(id)?;
        let _lock = race(cancel, id, operation.as_str(), async {
            Ok(slot.op_lock.lock().await)
        })
        .await?;

        // Deregistered while we waited for the lock
        if !self.registry.holds(id, &slot) {
            return Err(CorralError::NotFound(id.to_string()));
        }

        let current = slot.snapshot();
        let via = match lifecycle::plan(id, current.state, operation)? {
            Plan::Noop => {
                debug!("Sandbox {} already {}, nothing to do", id, current.state);
                return Ok(current);
            }
            Plan::Proceed { via } => via,
        };

        let adapter = self.adapters.get(current.runtime)?;

        let pending = via.map(|state| {
            info!("Sandbox {}: {} -> {}", id, current.state, state);
            slot.update(|sb| sb.state = state);
            PendingTransition::arm(slot.clone(), operation)
        });

        let outcome = race(
            cancel,
            id,
            operation.as_str(),
            self.drive(adapter.as_ref(), &current, operation),
        )
        .await;

        if let Some(pending) = pending {
            pending.disarm();
        }

        match outcome {
            Ok(()) => self.settle(id, &slot, operation),
            Err(e) => Err(self.fail(cancel, &slot, adapter.as_ref(), operation, e).await),
        }
    }

    /// The runtime side of one operation, retried on transient failures.
    async fn drive(
        &self,
        adapter: &dyn RuntimeAdapter,
        sandbox: &Sandbox,
        operation: Operation,
    ) -> Result<()> {
        let label = format!("{} {}", operation.as_str(), sandbox.id());
        match operation {
            Operation::Start => {
                accept_benign(self.retry.run(&label, move || adapter.start(sandbox)).await)?;
                self.await_ready(adapter, sandbox).await
            }
            Operation::Stop | Operation::Reset => {
                accept_benign(self.retry.run(&label, move || adapter.stop(sandbox)).await)
            }
            Operation::Pause => self.retry.run(&label, move || adapter.pause(sandbox)).await,
            Operation::Resume => self.retry.run(&label, move || adapter.resume(sandbox)).await,
            Operation::Deregister => self.retry.run(&label, move || adapter.remove(sandbox)).await,
        }
    }

    /// Poll until the container reports running. Rolls back with a stop when
    /// it never does.
    async fn await_ready(&self, adapter: &dyn RuntimeAdapter, sandbox: &Sandbox) -> Result<()> {
        let max_probes = self.readiness.max_probes;
        for probe in 1..=max_probes {
            let status = adapter.status(sandbox).await;
            if status == ContainerStatus::Running {
                debug!("Sandbox {} ready after {} probe(s)", sandbox.id(), probe);
                return Ok(());
            }
            debug!(
                "Sandbox {} probe {}/{}: {}",
                sandbox.id(),
                probe,
                max_probes,
                status
            );
            if probe < max_probes {
                tokio::time::sleep(self.readiness.interval).await;
            }
        }

        warn!(
            "Sandbox {} never reported running, rolling back",
            sandbox.id()
        );
        if let Err(e) = adapter.stop(sandbox).await {
            warn!("Rollback stop of sandbox {} failed: {}", sandbox.id(), e);
        }
        Err(CorralError::HealthCheckFailed {
            id: sandbox.id().to_string(),
            probes: max_probes,
        })
    }

    fn settle(&self, id: &str, slot: &SandboxSlot, operation: Operation) -> Result<Sandbox> {
        let Some(target) = operation.target() else {
            let removed = self.registry.deregister(id)?;
            self.ports.release(&removed.host_ports());
            info!("Deregistered sandbox {}", id);
            return Ok(removed);
        };

        let status = lifecycle::implied_status(target).unwrap_or_default();
        let settled = slot.update(|sb| {
            sb.state = target;
            sb.status = status;
            sb.last_error = None;
        });
        info!("Sandbox {} is {}", id, target);
        Ok(settled)
    }

    async fn fail(
        &self,
        cancel: &CancellationToken,
        slot: &SandboxSlot,
        adapter: &dyn RuntimeAdapter,
        operation: Operation,
        err: CorralError,
    ) -> CorralError {
        let message = err.to_string();

        if !operation.fails_sandbox() {
            warn!("{} failed: {}", operation.as_str(), message);
            slot.update(|sb| sb.last_error = Some(message));
            return err;
        }

        // Failed is written before the status query; a caller dropping us
        // there must not find the sandbox still Starting or Stopping.
        error!("Sandbox {} failed during {}: {}", slot.snapshot().id(), operation.as_str(), message);
        let failed = slot.update(|sb| {
            sb.state = LifecycleState::Failed;
            sb.status = ContainerStatus::Unknown;
            sb.last_error = Some(message);
        });
        if matches!(err, CorralError::Cancelled { .. }) {
            return err;
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => ContainerStatus::Unknown,
            status = adapter.status(&failed) => status,
        };
        let current = slot.snapshot();
        if current.state == LifecycleState::Failed && current.updated_at == failed.updated_at {
            slot.update(|sb| sb.status = status);
        }
        err
    }
}

/// Marks the sandbox Failed if the operation future is dropped mid-flight.
struct PendingTransition {
    slot: Option<Arc<SandboxSlot>>,
    operation: Operation,
}

impl PendingTransition {
    fn arm(slot: Arc<SandboxSlot>, operation: Operation) -> Self {
        Self {
            slot: Some(slot),
            operation,
        }
    }

    fn disarm(mut self) {
        self.slot = None;
    }
}

impl Drop for PendingTransition {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let operation = self.operation.as_str();
            let sandbox = slot.update(|sb| {
                sb.state = LifecycleState::Failed;
                sb.status = ContainerStatus::Unknown;
                sb.last_error = Some(format!("{} interrupted", operation));
            });
            warn!("{} of sandbox {} interrupted, marked failed", operation, sandbox.id());
        }
    }
}

/// Run `future` unless `cancel` fires first.
async fn race<T>(
    cancel: &CancellationToken,
    id: &str,
    operation: &'static str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CorralError::Cancelled {
            id: id.to_string(),
            operation,
        }),
        result = future => result,
    }
}

fn is_unchanged(current: &Sandbox, seen: &Sandbox) -> bool {
    current.state == seen.state && current.updated_at == seen.updated_at
}

fn accept_benign(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_benign() => {
            debug!("{}", e);
            Ok(())
        }
        other => other,
    }
}

fn validate_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CorralError::InvalidArgument(format!(
            "invalid sandbox id {:?}: use letters, digits, '-', '_' or '.'",
            id
        )))
    }
}
