use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use super::api::{self, AppState, SharedState};
use super::controller::JobController;
use super::poller::FileSizePoller;
use super::worker::ProcessWorker;
use super::ws::{self, EventBus};
use crate::config::Settings;

/// Build the full application router: API, WebSocket, and static UI.
///
/// The static directory is only mounted when it exists.
pub fn build_router(state: SharedState, public_dir: Option<&Path>) -> Router {
    let router = api::api_router().route("/ws", get(ws::ws_handler));

    let router = match public_dir {
        Some(dir) if dir.is_dir() => router.fallback_service(ServeDir::new(dir)),
        Some(dir) => {
            tracing::warn!(dir = %dir.display(), "Public directory not found, UI disabled");
            router
        }
        None => router,
    };

    router.with_state(state)
}

/// Wire the controller and its collaborators from resolved settings.
pub fn build_state(settings: &Settings) -> Result<SharedState> {
    let artifact_dir = settings.worker.artifact_dir.clone();
    std::fs::create_dir_all(&artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory: {}",
            artifact_dir.display()
        )
    })?;

    let events = EventBus::default();
    let worker = ProcessWorker::new(
        settings.worker.program.clone(),
        settings.worker.args.clone(),
        &artifact_dir,
    );
    let poller = FileSizePoller::new(&artifact_dir, settings.poll_interval());
    let controller = JobController::new(
        Arc::new(worker),
        events.clone(),
        poller,
        settings.job.diagnostic_policy,
    );

    Ok(Arc::new(AppState {
        controller: Arc::new(controller),
        events,
        artifact_dir,
        replay_state_on_connect: settings.job.replay_state_on_connect,
    }))
}

/// Build state and router from settings, applying the dev-mode CORS layer.
pub fn build_app(settings: &Settings) -> Result<(SharedState, Router)> {
    let state = build_state(settings)?;
    let mut app = build_router(state.clone(), Some(settings.server.public_dir.as_path()));
    if settings.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    Ok((state, app))
}

/// Serve on an already bound listener until `shutdown` resolves, then ask
/// any running worker to exit.
pub async fn serve<F>(listener: TcpListener, state: SharedState, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let controller = state.controller.clone();
    let signal = async move {
        shutdown.await;
        controller.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("Server error")?;

    Ok(())
}

/// Start the OmniGen server and block until Ctrl+C.
pub async fn start_server(settings: Settings) -> Result<()> {
    let (state, app) = build_app(&settings)?;

    let addr = settings.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        worker = %settings.worker.program,
        artifact_dir = %settings.worker.artifact_dir.display(),
        policy = %settings.job.diagnostic_policy,
        "OmniGen server listening"
    );

    if settings.server.open_browser {
        let url = format!("http://localhost:{}", local_addr.port());
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                tracing::warn!(url = %url, error = %e, "Failed to open browser");
            }
        });
    }

    serve(listener, state, app, shutdown_signal()).await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
