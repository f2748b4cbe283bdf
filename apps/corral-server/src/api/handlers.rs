use crate::api::error::ApiError;
use crate::api::routes::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use corral_core::{
    ContainerStatus, ExecutionKind, ExecutionResult, LifecycleState, Sandbox, SandboxFilter,
    SandboxKind, SandboxRequest, SandboxRuntimeType,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub kind: Option<String>,
    pub runtime: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> Result<SandboxFilter, ApiError> {
        Ok(SandboxFilter {
            kind: self.kind.as_deref().map(str::parse::<SandboxKind>).transpose()?,
            runtime: self
                .runtime
                .as_deref()
                .map(str::parse::<SandboxRuntimeType>)
                .transpose()?,
            state: self.state.as_deref().map(str::parse::<LifecycleState>).transpose()?,
            status: self.status.as_deref().map(str::parse::<ContainerStatus>).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PythonRequest {
    pub code: String,
    #[serde(default)]
    pub split_output: bool,
}

#[derive(Debug, Deserialize)]
pub struct ShellRequest {
    pub command: String,
    #[serde(default)]
    pub split_output: bool,
}

pub async fn healthz() -> &'static str {
    "OK"
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "corral",
    }))
}

pub async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SandboxRequest>,
) -> Result<(StatusCode, Json<Sandbox>), ApiError> {
    let sandbox = state.controller.provision(request)?;
    Ok((StatusCode::CREATED, Json(sandbox)))
}

pub async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Sandbox>> {
    let filter = query.into_filter()?;
    Ok(Json(state.controller.list(&filter)))
}

pub async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    Ok(Json(state.controller.describe(&id)?))
}

pub async fn delete_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.deregister(&cancel, &id).await?))
}

pub async fn start_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.start(&cancel, &id).await?))
}

pub async fn stop_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.stop(&cancel, &id).await?))
}

pub async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.pause(&cancel, &id).await?))
}

pub async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.resume(&cancel, &id).await?))
}

pub async fn reset_sandbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sandbox> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.controller.reset(&cancel, &id).await?))
}

pub async fn is_running(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let cancel = state.shutdown.child_token();
    let running = state.controller.is_running(&cancel, &id).await?;
    Ok(Json(json!({ "id": id, "running": running })))
}

pub async fn is_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let cancel = state.shutdown.child_token();
    let enabled = state.controller.is_enabled(&cancel, &id).await?;
    Ok(Json(json!({ "id": id, "enabled": enabled })))
}

pub async fn sandbox_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let cancel = state.shutdown.child_token();
    let status = state.controller.status(&cancel, &id).await?;
    Ok(Json(json!({ "id": id, "status": status })))
}

pub async fn sandbox_type(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let runtime = state.controller.sandbox_type(&id)?;
    Ok(Json(json!({ "id": id, "runtime": runtime })))
}

pub async fn execute_python(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<PythonRequest>,
) -> ApiResult<ExecutionResult> {
    let cancel = state.shutdown.child_token();
    let result = state
        .controller
        .execute(&cancel, &id, ExecutionKind::Python, &request.code, request.split_output)
        .await?;
    Ok(Json(result))
}

pub async fn execute_shell(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ShellRequest>,
) -> ApiResult<ExecutionResult> {
    let cancel = state.shutdown.child_token();
    let result = state
        .controller
        .execute(&cancel, &id, ExecutionKind::Shell, &request.command, request.split_output)
        .await?;
    Ok(Json(result))
}
