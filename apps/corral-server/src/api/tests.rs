use crate::api::routes::{AppState, app};
use async_trait::async_trait;
use axum::{Json, Router, http::HeaderMap, routing::post};
use corral_box::{AdapterSet, RuntimeAdapter};
use corral_core::{
    ContainerStatus, CorralConfig, CorralError, ExecutionResult, LifecycleState, Result, Sandbox,
    SandboxKind, SandboxRuntimeType, TextContent,
};
use corral_manager::{LifecycleController, SandboxRegistry};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Runtime that keeps container states in memory and can be switched off.
#[derive(Default)]
struct MemoryRuntime {
    containers: Mutex<HashMap<String, ContainerStatus>>,
    down: Mutex<bool>,
}

impl MemoryRuntime {
    fn check(&self, sandbox: &Sandbox) -> Result<()> {
        if *self.down.lock().unwrap() {
            return Err(CorralError::RuntimeUnavailable {
                runtime: SandboxRuntimeType::Docker,
                id: sandbox.id().to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn set(&self, sandbox: &Sandbox, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .insert(sandbox.container_name.clone(), status);
    }
}

#[async_trait]
impl RuntimeAdapter for MemoryRuntime {
    fn runtime_type(&self) -> SandboxRuntimeType {
        SandboxRuntimeType::Docker
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        self.check(sandbox)?;
        self.set(sandbox, ContainerStatus::Running);
        Ok(())
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        self.check(sandbox)?;
        self.set(sandbox, ContainerStatus::Stopped);
        Ok(())
    }

    async fn pause(&self, sandbox: &Sandbox) -> Result<()> {
        self.check(sandbox)?;
        self.set(sandbox, ContainerStatus::Paused);
        Ok(())
    }

    async fn resume(&self, sandbox: &Sandbox) -> Result<()> {
        self.check(sandbox)?;
        self.set(sandbox, ContainerStatus::Running);
        Ok(())
    }

    async fn remove(&self, sandbox: &Sandbox) -> Result<()> {
        self.check(sandbox)?;
        self.containers.lock().unwrap().remove(&sandbox.container_name);
        Ok(())
    }

    async fn status(&self, sandbox: &Sandbox) -> ContainerStatus {
        if *self.down.lock().unwrap() {
            return ContainerStatus::Unknown;
        }
        self.containers
            .lock()
            .unwrap()
            .get(&sandbox.container_name)
            .copied()
            .unwrap_or(ContainerStatus::Stopped)
    }

    async fn ping(&self) -> bool {
        !*self.down.lock().unwrap()
    }

    async fn is_enabled(&self, sandbox: &Sandbox) -> bool {
        self.ping().await && self.containers.lock().unwrap().contains_key(&sandbox.container_name)
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    runtime: Arc<MemoryRuntime>,
    controller: Arc<LifecycleController>,
}

impl TestServer {
    async fn spawn(auth_token: Option<&str>) -> Self {
        let mut config = CorralConfig::default();
        config.retry.max_attempts = 2;
        config.retry.initial_backoff_ms = 1;
        config.readiness.probe_interval_ms = 1;

        let runtime = Arc::new(MemoryRuntime::default());
        let adapters = AdapterSet::new().with(runtime.clone());
        let controller = Arc::new(LifecycleController::new(
            &config,
            adapters,
            Arc::new(SandboxRegistry::new()),
        ));
        let state = Arc::new(AppState {
            controller: controller.clone(),
            auth_token: auth_token.map(str::to_string),
            shutdown: CancellationToken::new(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            runtime,
            controller,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client.post(self.url(path)).send().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    async fn create(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/sandboxes"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

/// Stand-in for the tool server inside a sandbox. Echoes the submitted
/// source back and insists on `Bearer tool-token`.
async fn spawn_tool_server() -> String {
    fn reply(
        headers: &HeaderMap,
        text: String,
    ) -> std::result::Result<Json<ExecutionResult>, axum::http::StatusCode> {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer tool-token");
        if !authorized {
            return Err(axum::http::StatusCode::UNAUTHORIZED);
        }
        Ok(Json(ExecutionResult {
            content: vec![TextContent {
                content_type: "text".into(),
                text,
                description: None,
            }],
            is_error: false,
        }))
    }

    let tools = Router::new()
        .route(
            "/tools/run_ipython_cell",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                reply(&headers, format!("python:{}:{}", body["code"], body["split_output"]))
            }),
        )
        .route(
            "/tools/run_shell_command",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                reply(&headers, format!("shell:{}:{}", body["command"], body["split_output"]))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, tools).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_endpoints() {
    let server = TestServer::spawn(None).await;

    let res = server.get("/healthz").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "OK");

    let body: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "corral");
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let server = TestServer::spawn(None).await;

    let res = server.create(json!({ "id": "sb-1", "kind": "browser" })).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Sandbox = res.json().await.unwrap();
    assert_eq!(created.id(), "sb-1");
    assert_eq!(created.state, LifecycleState::Created);
    assert_eq!(created.ports.len(), 2);

    let started: Sandbox = server.post("/sandboxes/sb-1/start").await.json().await.unwrap();
    assert_eq!(started.state, LifecycleState::Running);

    let body: Value = server.get("/sandboxes/sb-1/running").await.json().await.unwrap();
    assert_eq!(body["running"], true);
    let body: Value = server.get("/sandboxes/sb-1/enabled").await.json().await.unwrap();
    assert_eq!(body["enabled"], true);
    let body: Value = server.get("/sandboxes/sb-1/status").await.json().await.unwrap();
    assert_eq!(body["status"], "running");
    let body: Value = server.get("/sandboxes/sb-1/type").await.json().await.unwrap();
    assert_eq!(body["runtime"], "docker");

    let paused: Sandbox = server.post("/sandboxes/sb-1/pause").await.json().await.unwrap();
    assert_eq!(paused.state, LifecycleState::Paused);
    let resumed: Sandbox = server.post("/sandboxes/sb-1/resume").await.json().await.unwrap();
    assert_eq!(resumed.state, LifecycleState::Running);

    // Running sandboxes cannot be deleted
    let res = server.client.delete(server.url("/sandboxes/sb-1")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    for _ in 0..2 {
        let res = server.post("/sandboxes/sb-1/stop").await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = server.client.delete(server.url("/sandboxes/sb-1")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(server.get("/sandboxes/sb-1").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let server = TestServer::spawn(None).await;

    assert_eq!(
        server.get("/sandboxes/ghost/running").await.status(),
        StatusCode::NOT_FOUND
    );

    server.create(json!({ "id": "sb-1" })).await;
    let res = server.create(json!({ "id": "sb-1" })).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("sb-1"));

    let res = server.create(json!({ "runtime": "podman" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    *server.runtime.down.lock().unwrap() = true;
    let res = server.post("/sandboxes/sb-1/start").await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    *server.runtime.down.lock().unwrap() = false;

    let failed: Sandbox = server.get("/sandboxes/sb-1").await.json().await.unwrap();
    assert_eq!(failed.state, LifecycleState::Failed);

    let reset: Sandbox = server.post("/sandboxes/sb-1/reset").await.json().await.unwrap();
    assert_eq!(reset.state, LifecycleState::Created);
}

#[tokio::test]
async fn list_filters_by_query() {
    let server = TestServer::spawn(None).await;
    server.create(json!({ "id": "a", "kind": "base" })).await;
    server.create(json!({ "id": "b", "kind": "fs" })).await;
    server.create(json!({ "id": "c", "kind": "browser" })).await;
    server.post("/sandboxes/c/start").await;

    let all: Vec<Sandbox> = server.get("/sandboxes").await.json().await.unwrap();
    assert_eq!(all.len(), 3);

    let running: Vec<Sandbox> = server
        .get("/sandboxes?state=running")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id(), "c");

    let fs: Vec<Sandbox> = server.get("/sandboxes?kind=filesystem").await.json().await.unwrap();
    assert_eq!(fs.len(), 1);
    assert_eq!(fs[0].id(), "b");

    let res = server.get("/sandboxes?state=sleeping").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn token_guards_sandbox_routes() {
    let server = TestServer::spawn(Some("s3cret")).await;

    assert_eq!(server.get("/healthz").await.status(), StatusCode::OK);
    assert_eq!(server.get("/sandboxes").await.status(), StatusCode::UNAUTHORIZED);

    let res = server
        .client
        .get(server.url("/sandboxes"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server
        .client
        .get(server.url("/sandboxes"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(
        server.get("/sandboxes?token=s3cret").await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn execution_is_forwarded_to_the_tool_server() {
    let server = TestServer::spawn(None).await;
    let tools = spawn_tool_server().await;

    let mut sb = Sandbox::new("sb-1", "sb-1", SandboxKind::Base, SandboxRuntimeType::Docker);
    sb.base_url = Some(tools.clone());
    sb.runtime_token = Some("tool-token".into());
    server.controller.register(sb).unwrap();

    let python = json!({ "code": "print(1)" });
    let res = server
        .client
        .post(server.url("/sandboxes/sb-1/execute/python"))
        .json(&python)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    server.post("/sandboxes/sb-1/start").await;

    let result: ExecutionResult = server
        .client
        .post(server.url("/sandboxes/sb-1/execute/python"))
        .json(&python)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].text, "python:\"print(1)\":false");

    let result: ExecutionResult = server
        .client
        .post(server.url("/sandboxes/sb-1/execute/shell"))
        .json(&json!({ "command": "ls -la", "split_output": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result.content[0].text, "shell:\"ls -la\":true");

    // A sandbox whose token the tool server does not accept
    let mut other = Sandbox::new("sb-2", "sb-2", SandboxKind::Base, SandboxRuntimeType::Docker);
    other.base_url = Some(tools);
    other.runtime_token = Some("stale".into());
    server.controller.register(other).unwrap();
    server.post("/sandboxes/sb-2/start").await;

    let res = server
        .client
        .post(server.url("/sandboxes/sb-2/execute/shell"))
        .json(&json!({ "command": "ls" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("401"));
}
