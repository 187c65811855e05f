use std::net::SocketAddr;
use std::sync::Arc;

use chatvision_cloud::VideoStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatvision_api::config::ServerConfig;
use chatvision_api::router::build_app_router;
use chatvision_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatvision_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().unwrap_or_else(|e| panic!("Invalid configuration: {e}"));
    tracing::info!(
        host = %config.host,
        port = %config.port,
        max_video_size_mb = config.max_video_size_mb,
        video_extract_fps = config.video_extract_fps,
        max_frames_per_request = config.max_frames_per_request,
        "Loaded server configuration",
    );

    // --- Completion client ---
    let completions = config
        .provider
        .build_client(&config.openai_model)
        .unwrap_or_else(|e| panic!("Failed to build completion client: {e}"));

    // --- Durable store ---
    let store = config.storage.clone().map(|storage| Arc::new(VideoStore::new(storage)));
    match &store {
        Some(store) => {
            if let Err(e) = store.initialize().await {
                tracing::warn!(error = %e, "Blob storage not reachable at startup; will retry on first upload");
            }
        }
        None => tracing::info!("STORAGE_ACCOUNT_URL not set; uploads will not be stored"),
    }

    // --- App state + router ---
    let state = AppState::new(config.clone(), completions, store.clone());
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    if let Some(store) = store {
        store.close().await;
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
