use async_trait::async_trait;
use corral_core::{ContainerStatus, Result, Sandbox, SandboxRuntimeType};

/// Drives sandbox containers on one container runtime.
///
/// Lifecycle calls return errors from the `CorralError` taxonomy. Queries
/// never fail: when the runtime cannot be asked they degrade to
/// `ContainerStatus::Unknown` / `false`.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn runtime_type(&self) -> SandboxRuntimeType;

    /// Create the container if needed and start it.
    ///
    /// Fails with `RuntimeUnavailable` when the daemon is unreachable,
    /// `AlreadyRunning` when it is already up and `ResourceExhausted` when the
    /// runtime refuses to allocate.
    async fn start(&self, sandbox: &Sandbox) -> Result<()>;

    /// Stop the container. Stopping a stopped or missing container succeeds.
    async fn stop(&self, sandbox: &Sandbox) -> Result<()>;

    async fn pause(&self, sandbox: &Sandbox) -> Result<()>;

    async fn resume(&self, sandbox: &Sandbox) -> Result<()>;

    /// Delete the container. Removing a missing container succeeds.
    async fn remove(&self, sandbox: &Sandbox) -> Result<()>;

    async fn status(&self, sandbox: &Sandbox) -> ContainerStatus;

    /// Whether the daemon answers at all.
    async fn ping(&self) -> bool;

    async fn is_running(&self, sandbox: &Sandbox) -> bool {
        self.status(sandbox).await == ContainerStatus::Running
    }

    /// The runtime is reachable and the sandbox's container exists.
    async fn is_enabled(&self, sandbox: &Sandbox) -> bool;
}
