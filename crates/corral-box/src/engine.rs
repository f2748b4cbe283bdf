use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use corral_core::config::RuntimeConfig;
use corral_core::{ContainerStatus, CorralError, Result, Sandbox, SandboxRuntimeType};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::blueprint::{BlueprintSettings, ContainerBlueprint};
use crate::classify;
use crate::traits::RuntimeAdapter;

/// Adapter for runtimes speaking the Docker Engine API.
///
/// Docker itself and Podman (through its compatibility socket) both go
/// through here; only the endpoint and the reported runtime type differ.
pub struct EngineAdapter {
    runtime: SandboxRuntimeType,
    docker: Docker,
    settings: BlueprintSettings,
    stop_timeout_secs: i64,
}

impl EngineAdapter {
    pub fn docker(config: &RuntimeConfig, settings: BlueprintSettings) -> Result<Self> {
        Self::connect(SandboxRuntimeType::Docker, &config.docker_host, config, settings)
    }

    pub fn podman(config: &RuntimeConfig, settings: BlueprintSettings) -> Result<Self> {
        Self::connect(SandboxRuntimeType::Podman, &config.podman_host, config, settings)
    }

    fn connect(
        runtime: SandboxRuntimeType,
        endpoint: &str,
        config: &RuntimeConfig,
        settings: BlueprintSettings,
    ) -> Result<Self> {
        let timeout = config.request_timeout_secs;
        let connected = if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, timeout, API_DEFAULT_VERSION)
        } else {
            let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
            Docker::connect_with_unix(path, timeout, API_DEFAULT_VERSION)
        };

        let docker = connected.map_err(|e| CorralError::Connect {
            runtime,
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        info!("{} adapter configured for {}", runtime, endpoint);

        Ok(Self {
            runtime,
            docker,
            settings,
            stop_timeout_secs: config.stop_timeout_secs as i64,
        })
    }

    async fn inspect(&self, name: &str) -> std::result::Result<ContainerInspectResponse, BollardError> {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
    }

    async fn ensure_image(&self, sandbox: &Sandbox, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_reference(image);
        info!("Pulling {}:{} for sandbox {}", from_image, tag, sandbox.id());

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: from_image.to_string(),
                    tag: tag.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| classify_engine_error(self.runtime, sandbox.id(), "pull image", &e))?;

        Ok(())
    }

    async fn create(&self, sandbox: &Sandbox, blueprint: &ContainerBlueprint) -> Result<()> {
        self.ensure_image(sandbox, &blueprint.image).await?;

        let options = CreateContainerOptions {
            name: blueprint.name.clone(),
            platform: None,
        };

        match self
            .docker
            .create_container(Some(options), container_config(blueprint))
            .await
        {
            Ok(response) => {
                for warning in response.warnings {
                    warn!("Create warning for sandbox {}: {}", sandbox.id(), warning);
                }
                info!("Created container {} for sandbox {}", blueprint.name, sandbox.id());
                Ok(())
            }
            // Someone else created it between our inspect and create
            Err(e) if status_code(&e) == Some(409) => {
                debug!("Container {} already exists", blueprint.name);
                Ok(())
            }
            Err(e) => Err(classify_engine_error(self.runtime, sandbox.id(), "create", &e)),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for EngineAdapter {
    fn runtime_type(&self) -> SandboxRuntimeType {
        self.runtime
    }

    #[instrument(skip(self, sandbox), fields(runtime = %self.runtime, id = sandbox.id()))]
    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let blueprint = self.settings.blueprint(sandbox);

        match self.inspect(&blueprint.name).await {
            Ok(info) => {
                if inspected_status(&info) == ContainerStatus::Running {
                    return Err(CorralError::AlreadyRunning {
                        id: sandbox.id().to_string(),
                    });
                }
            }
            Err(e) if status_code(&e) == Some(404) => self.create(sandbox, &blueprint).await?,
            Err(e) => return Err(classify_engine_error(self.runtime, sandbox.id(), "inspect", &e)),
        }

        match self
            .docker
            .start_container(&blueprint.name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!("Started container {}", blueprint.name);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(304) => Err(CorralError::AlreadyRunning {
                id: sandbox.id().to_string(),
            }),
            Err(e) => Err(classify_engine_error(self.runtime, sandbox.id(), "start", &e)),
        }
    }

    #[instrument(skip(self, sandbox), fields(runtime = %self.runtime, id = sandbox.id()))]
    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };
        match self
            .docker
            .stop_container(&sandbox.container_name, Some(options))
            .await
        {
            Ok(()) => {
                info!("Stopped container {}", sandbox.container_name);
                Ok(())
            }
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {
                debug!("Container {} already stopped or gone", sandbox.container_name);
                Ok(())
            }
            Err(e) => Err(classify_engine_error(self.runtime, sandbox.id(), "stop", &e)),
        }
    }

    #[instrument(skip(self, sandbox), fields(runtime = %self.runtime, id = sandbox.id()))]
    async fn pause(&self, sandbox: &Sandbox) -> Result<()> {
        self.docker
            .pause_container(&sandbox.container_name)
            .await
            .map_err(|e| classify_engine_error(self.runtime, sandbox.id(), "pause", &e))
    }

    #[instrument(skip(self, sandbox), fields(runtime = %self.runtime, id = sandbox.id()))]
    async fn resume(&self, sandbox: &Sandbox) -> Result<()> {
        self.docker
            .unpause_container(&sandbox.container_name)
            .await
            .map_err(|e| classify_engine_error(self.runtime, sandbox.id(), "resume", &e))
    }

    #[instrument(skip(self, sandbox), fields(runtime = %self.runtime, id = sandbox.id()))]
    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&sandbox.container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(classify_engine_error(self.runtime, sandbox.id(), "remove", &e)),
        }
    }

    async fn status(&self, sandbox: &Sandbox) -> ContainerStatus {
        match self.inspect(&sandbox.container_name).await {
            Ok(info) => inspected_status(&info),
            // Never created, or already removed: definitely not running
            Err(e) if status_code(&e) == Some(404) => ContainerStatus::Stopped,
            Err(e) => {
                warn!("Cannot inspect sandbox {} on {}: {}", sandbox.id(), self.runtime, e);
                ContainerStatus::Unknown
            }
        }
    }

    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn is_enabled(&self, sandbox: &Sandbox) -> bool {
        self.ping().await && self.inspect(&sandbox.container_name).await.is_ok()
    }
}

fn container_config(blueprint: &ContainerBlueprint) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &blueprint.ports {
        let key = format!("{}/tcp", port.container);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host.to_string()),
            }]),
        );
    }

    Config {
        image: Some(blueprint.image.clone()),
        env: Some(blueprint.env.clone()),
        labels: Some(blueprint.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            binds: if blueprint.binds.is_empty() {
                None
            } else {
                Some(blueprint.binds.clone())
            },
            network_mode: Some("bridge".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn inspected_status(info: &ContainerInspectResponse) -> ContainerStatus {
    info.state
        .as_ref()
        .and_then(|state| state.status.as_ref())
        .map(|status| ContainerStatus::from_engine_state(&status.to_string()))
        .unwrap_or(ContainerStatus::Unknown)
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// `registry:5000/org/image:tag` -> (`registry:5000/org/image`, `tag`).
pub fn split_image_reference(image: &str) -> (&str, &str) {
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(offset) => {
            let colon = last_segment_start + offset;
            (&image[..colon], &image[colon + 1..])
        }
        None => (image, "latest"),
    }
}

/// Map a bollard failure onto the error taxonomy.
pub fn classify_engine_error(
    runtime: SandboxRuntimeType,
    id: &str,
    operation: &str,
    error: &BollardError,
) -> CorralError {
    let id = id.to_string();
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if classify::is_exhaustion(message) {
                CorralError::ResourceExhausted {
                    runtime,
                    id,
                    reason: message.clone(),
                }
            } else {
                CorralError::Runtime {
                    runtime,
                    id,
                    reason: format!("{} failed with HTTP {}: {}", operation, status_code, message),
                }
            }
        }
        BollardError::RequestTimeoutError
        | BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. } => CorralError::RuntimeUnavailable {
            runtime,
            id,
            reason: format!("{}: {}", operation, error),
        },
        other => {
            let message = other.to_string();
            if classify::is_unreachable(&message) {
                CorralError::RuntimeUnavailable {
                    runtime,
                    id,
                    reason: format!("{}: {}", operation, message),
                }
            } else {
                CorralError::Runtime {
                    runtime,
                    id,
                    reason: format!("{}: {}", operation, message),
                }
            }
        }
    }
}
