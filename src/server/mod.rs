pub mod error;
pub mod replication;
pub mod settings;
pub mod state;
pub mod trigger;

use anyhow::Result;
use axum::Router;
use state::AppState;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use trigger::ScheduledTriggers;

/// Build the HTTP application for the given state
pub fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/version", axum::routing::get(version_info))
        .merge(replication::routes());

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", api_routes)
        .merge(replication::notification_routes())
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Run the replication service: HTTP API, notification hooks and cron triggers
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new_for_server(&settings).await?;
    if state.hook_secret.is_none() {
        tracing::warn!("No hook secret configured, job status hooks are not authenticated");
    }

    info!("Starting scheduled replication triggers");
    let triggers = ScheduledTriggers::new(state.controller.clone()).await?;
    triggers.start().await?;
    info!("{} scheduled policies registered", triggers.jobs().len());

    let app = app(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("HTTP server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Graceful shutdown support
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shutdown complete");

    if let Err(e) = triggers.shutdown().await {
        tracing::warn!("Failed to stop scheduled triggers: {:#}", e);
    }

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": env!("CARGO_PKG_NAME"),
    }))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
