use async_trait::async_trait;
use corral_core::config::RuntimeConfig;
use corral_core::{ContainerStatus, CorralError, Result, Sandbox, SandboxRuntimeType};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::blueprint::{BlueprintSettings, ContainerBlueprint};
use crate::classify;
use crate::traits::RuntimeAdapter;

const RUNTIME: SandboxRuntimeType = SandboxRuntimeType::Containerd;

/// Drives containerd through the `nerdctl` CLI.
pub struct ContainerdAdapter {
    binary: String,
    global_args: Vec<String>,
    settings: BlueprintSettings,
    command_timeout: Duration,
    stop_timeout_secs: u64,
}

/// What came back from one CLI invocation.
#[derive(Debug)]
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl ContainerdAdapter {
    pub fn new(config: &RuntimeConfig, settings: BlueprintSettings) -> Self {
        let mut global_args = vec![
            "--namespace".to_string(),
            config.containerd_namespace.clone(),
        ];
        if let Some(address) = &config.containerd_address {
            global_args.push("--address".to_string());
            global_args.push(address.clone());
        }

        info!(
            "containerd adapter configured via {} (namespace {})",
            config.nerdctl_path, config.containerd_namespace
        );

        Self {
            binary: config.nerdctl_path.clone(),
            global_args,
            settings,
            command_timeout: config.request_timeout(),
            stop_timeout_secs: config.stop_timeout_secs,
        }
    }

    async fn run(&self, id: &str, args: &[String]) -> Result<CliOutput> {
        debug!("{} {:?} {:?}", self.binary, self.global_args, args);

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(&self.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CorralError::RuntimeUnavailable {
                    runtime: RUNTIME,
                    id: id.to_string(),
                    reason: format!("cannot run {}: {}", self.binary, e),
                });
            }
            Err(_) => {
                return Err(CorralError::RuntimeUnavailable {
                    runtime: RUNTIME,
                    id: id.to_string(),
                    reason: format!(
                        "{} timed out after {}s",
                        self.binary,
                        self.command_timeout.as_secs()
                    ),
                });
            }
        };

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command whose failure is an error.
    async fn run_checked(&self, id: &str, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(id, args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_cli_failure(id, operation, &output.stderr))
        }
    }

    /// `Ok(None)` when the container does not exist.
    async fn inspect_state(&self, id: &str, container: &str) -> Result<Option<ContainerStatus>> {
        let output = self.run(id, &inspect_args(container)).await?;
        if output.success {
            return Ok(Some(ContainerStatus::from_engine_state(&output.stdout)));
        }
        if classify::is_missing(&output.stderr) {
            return Ok(None);
        }
        Err(classify_cli_failure(id, "inspect", &output.stderr))
    }
}

#[async_trait]
impl RuntimeAdapter for ContainerdAdapter {
    fn runtime_type(&self) -> SandboxRuntimeType {
        RUNTIME
    }

    #[instrument(skip(self, sandbox), fields(runtime = "containerd", id = sandbox.id()))]
    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let blueprint = self.settings.blueprint(sandbox);

        match self.inspect_state(sandbox.id(), &blueprint.name).await? {
            Some(ContainerStatus::Running) => {
                return Err(CorralError::AlreadyRunning {
                    id: sandbox.id().to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.run_checked(sandbox.id(), "create", &create_args(&blueprint))
                    .await?;
                info!("Created container {} for sandbox {}", blueprint.name, sandbox.id());
            }
        }

        self.run_checked(sandbox.id(), "start", &simple_args("start", &blueprint.name))
            .await?;
        info!("Started container {}", blueprint.name);
        Ok(())
    }

    #[instrument(skip(self, sandbox), fields(runtime = "containerd", id = sandbox.id()))]
    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        let args = stop_args(&sandbox.container_name, self.stop_timeout_secs);
        let output = self.run(sandbox.id(), &args).await?;
        if output.success || classify::is_missing(&output.stderr) {
            return Ok(());
        }
        let lower = output.stderr.to_ascii_lowercase();
        if lower.contains("not running") || lower.contains("already stopped") {
            return Ok(());
        }
        Err(classify_cli_failure(sandbox.id(), "stop", &output.stderr))
    }

    async fn pause(&self, sandbox: &Sandbox) -> Result<()> {
        self.run_checked(
            sandbox.id(),
            "pause",
            &simple_args("pause", &sandbox.container_name),
        )
        .await
        .map(|_| ())
    }

    async fn resume(&self, sandbox: &Sandbox) -> Result<()> {
        self.run_checked(
            sandbox.id(),
            "resume",
            &simple_args("unpause", &sandbox.container_name),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        let output = self.run(sandbox.id(), &remove_args(&sandbox.container_name)).await?;
        if output.success || classify::is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(classify_cli_failure(sandbox.id(), "remove", &output.stderr))
        }
    }

    async fn status(&self, sandbox: &Sandbox) -> ContainerStatus {
        match self.inspect_state(sandbox.id(), &sandbox.container_name).await {
            Ok(Some(status)) => status,
            Ok(None) => ContainerStatus::Stopped,
            Err(e) => {
                warn!("Cannot inspect sandbox {} on containerd: {}", sandbox.id(), e);
                ContainerStatus::Unknown
            }
        }
    }

    async fn ping(&self) -> bool {
        let args = vec!["info".to_string(), "--format".to_string(), "{{.ID}}".to_string()];
        matches!(self.run("-", &args).await, Ok(output) if output.success)
    }

    async fn is_enabled(&self, sandbox: &Sandbox) -> bool {
        matches!(
            self.inspect_state(sandbox.id(), &sandbox.container_name).await,
            Ok(Some(_))
        )
    }
}

fn create_args(blueprint: &ContainerBlueprint) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        blueprint.name.clone(),
    ];
    for port in &blueprint.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host, port.container));
    }
    for env in &blueprint.env {
        args.push("-e".to_string());
        args.push(env.clone());
    }
    for bind in &blueprint.binds {
        args.push("-v".to_string());
        args.push(bind.clone());
    }
    for (key, value) in &blueprint.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(blueprint.image.clone());
    args
}

fn inspect_args(container: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "--format".to_string(),
        "{{.State.Status}}".to_string(),
        container.to_string(),
    ]
}

fn stop_args(container: &str, timeout_secs: u64) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        timeout_secs.to_string(),
        container.to_string(),
    ]
}

fn remove_args(container: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), container.to_string()]
}

fn simple_args(verb: &str, container: &str) -> Vec<String> {
    vec![verb.to_string(), container.to_string()]
}

fn classify_cli_failure(id: &str, operation: &str, stderr: &str) -> CorralError {
    let id = id.to_string();
    let reason = if stderr.is_empty() {
        format!("{} failed", operation)
    } else {
        format!("{}: {}", operation, stderr)
    };

    if classify::is_unreachable(stderr) {
        CorralError::RuntimeUnavailable {
            runtime: RUNTIME,
            id,
            reason,
        }
    } else if classify::is_exhaustion(stderr) {
        CorralError::ResourceExhausted {
            runtime: RUNTIME,
            id,
            reason,
        }
    } else {
        CorralError::Runtime {
            runtime: RUNTIME,
            id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{PortMapping, SandboxKind};
    use std::path::PathBuf;

    fn adapter_with(config: RuntimeConfig) -> ContainerdAdapter {
        ContainerdAdapter::new(&config, BlueprintSettings::default())
    }

    #[test]
    fn global_args_carry_namespace_and_address() {
        let adapter = adapter_with(RuntimeConfig::default());
        assert_eq!(adapter.global_args, vec!["--namespace", "corral"]);

        let adapter = adapter_with(RuntimeConfig {
            containerd_address: Some("/run/k3s/containerd/containerd.sock".into()),
            ..Default::default()
        });
        assert_eq!(
            adapter.global_args,
            vec![
                "--namespace",
                "corral",
                "--address",
                "/run/k3s/containerd/containerd.sock"
            ]
        );
    }

    #[test]
    fn create_args_publish_ports_env_mounts_and_labels() {
        let mut sb = Sandbox::new("sb-1", "files", SandboxKind::Filesystem, RUNTIME);
        sb.container_name = "sandbox-sb-1".into();
        sb.ports = vec![PortMapping { host: 49160, container: 8000 }];
        sb.environment.insert("SESSION_ID".into(), "sb-1".into());
        sb.mount_dir = Some(PathBuf::from("/data/sb-1"));

        let args = create_args(&BlueprintSettings::default().blueprint(&sb));
        assert_eq!(&args[..3], &["create", "--name", "sandbox-sb-1"]);
        assert!(args.windows(2).any(|w| w == ["-p", "49160:8000"]));
        assert!(args.windows(2).any(|w| w == ["-e", "SESSION_ID=sb-1"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/data/sb-1:/workspace"]));
        assert!(args.windows(2).any(|w| w == ["--label", "corral.sandbox.kind=filesystem"]));
        assert_eq!(args.last().map(String::as_str), Some("agentruntime/sandbox:filesystem"));
    }

    #[test]
    fn stop_passes_grace_period() {
        assert_eq!(stop_args("c1", 10), vec!["stop", "-t", "10", "c1"]);
        assert_eq!(remove_args("c1"), vec!["rm", "-f", "c1"]);
    }

    #[test]
    fn cli_failures_are_classified() {
        let err = classify_cli_failure(
            "sb-1",
            "start",
            "failed to dial \"/run/containerd/containerd.sock\": connection refused",
        );
        assert!(err.is_transient());

        let err = classify_cli_failure("sb-1", "start", "port is already allocated");
        assert!(matches!(err, CorralError::ResourceExhausted { .. }));

        let err = classify_cli_failure("sb-1", "pause", "");
        match err {
            CorralError::Runtime { reason, .. } => assert_eq!(reason, "pause failed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let adapter = adapter_with(RuntimeConfig {
            nerdctl_path: "/nonexistent/nerdctl".into(),
            ..Default::default()
        });
        let sb = Sandbox::new("sb-1", "x", SandboxKind::Base, RUNTIME);

        let err = adapter.start(&sb).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(adapter.status(&sb).await, ContainerStatus::Unknown);
        assert!(!adapter.ping().await);
        assert!(!adapter.is_enabled(&sb).await);
    }
}
