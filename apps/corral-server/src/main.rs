mod api;

use api::routes::AppState;
use corral_box::AdapterSet;
use corral_core::config::CorralConfig;
use corral_manager::{LifecycleController, SandboxRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CorralConfig::new()?;

    let level = config.server.log_level.to_lowercase();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                format!(
                    "corral_server={level},corral_manager={level},corral_box={level},tower_http=debug"
                )
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Corral Server...");

    let adapters = AdapterSet::from_config(&config)?;
    let registry = Arc::new(SandboxRegistry::new());
    let controller = Arc::new(LifecycleController::new(&config, adapters, registry));
    tracing::info!("Runtimes: {:?}", controller.runtimes());

    if config.server.auth_token.is_none() {
        tracing::warn!("No auth token configured, sandbox routes are open");
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        controller: controller.clone(),
        auth_token: config.server.auth_token.clone(),
        shutdown: shutdown.clone(),
    });
    let app = api::routes::app(state);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    if config.shutdown.stop_running {
        let stopped = controller.stop_all(&CancellationToken::new()).await;
        tracing::info!("Stopped {} sandboxes on shutdown", stopped);
    }

    tracing::info!("Corral Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels in-flight operations.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
