//! rf-server: HTTP API, telemetry stream and ledger reaper.
//!
//! This crate puts a running [`Orchestrator`](rf_pipeline::Orchestrator)
//! behind an HTTP API. It provides:
//!
//! - Axum routes for job submission, status, cancellation and pipeline
//!   introspection
//! - An SSE stream of execution events
//! - A background task reaping expired jobs from the ledger
//! - Graceful shutdown via signal handling, cancelling in-flight executions

pub mod context;
pub mod error;
pub mod reaper;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::time::Duration;

use rf_core::config::Config;
use rf_pipeline::Runtime;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the reelforge server.
///
/// Builds the runtime from `config`, serves the API and runs the reaper.
/// Returns when a shutdown signal is received.
pub async fn start(config: Config) -> rf_core::Result<()> {
    let runtime = Runtime::build(&config).await?;
    let ctx = AppContext::new(&runtime, config.clone());

    let cancel = CancellationToken::new();

    let reaper_handle = tokio::spawn(reaper::run_reaper(
        ctx.orchestrator.clone(),
        Duration::from_secs(config.server.reap_interval_secs.max(1)),
        cancel.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| rf_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let app = router::build_router(ctx.clone());

    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| rf_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = reaper_handle.await;

    let running = ctx.orchestrator.shutdown().await;
    if running > 0 {
        tracing::warn!(running, "Shutting down with executions still in flight");
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
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
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
