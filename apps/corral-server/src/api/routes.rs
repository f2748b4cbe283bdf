use crate::api::{auth, handlers};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use corral_manager::LifecycleController;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub auth_token: Option<String>,
    /// Cancelled when the server shuts down; in-flight operations observe it.
    pub shutdown: CancellationToken,
}

pub fn app(state: Arc<AppState>) -> Router {
    let sandboxes = Router::new()
        .route(
            "/sandboxes",
            post(handlers::create_sandbox).get(handlers::list_sandboxes),
        )
        .route(
            "/sandboxes/:id",
            get(handlers::get_sandbox).delete(handlers::delete_sandbox),
        )
        .route("/sandboxes/:id/start", post(handlers::start_sandbox))
        .route("/sandboxes/:id/stop", post(handlers::stop_sandbox))
        .route("/sandboxes/:id/pause", post(handlers::pause_sandbox))
        .route("/sandboxes/:id/resume", post(handlers::resume_sandbox))
        .route("/sandboxes/:id/reset", post(handlers::reset_sandbox))
        .route("/sandboxes/:id/running", get(handlers::is_running))
        .route("/sandboxes/:id/enabled", get(handlers::is_enabled))
        .route("/sandboxes/:id/status", get(handlers::sandbox_status))
        .route("/sandboxes/:id/type", get(handlers::sandbox_type))
        .route("/sandboxes/:id/execute/python", post(handlers::execute_python))
        .route("/sandboxes/:id/execute/shell", post(handlers::execute_shell))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/health", get(handlers::health))
        .merge(sandboxes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
