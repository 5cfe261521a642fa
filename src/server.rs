//! HTTP server for the control panel.
//!
//! Serves the router from [`crate::api`] and, on shutdown, stops the active
//! batch and waits for its in-flight session so the simulator is never left
//! running with a half-written configuration.

use std::sync::Arc;

use anyhow::Result;

use crate::api::create_router;
use crate::orchestrator::SessionOrchestrator;

pub async fn start_http(orchestrator: Arc<SessionOrchestrator>, bind: &str) -> Result<()> {
    let router = create_router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;

    tracing::info!(
        "Control panel listening on http://{} (schedule: {})",
        listener.local_addr()?,
        orchestrator.schedule_source()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drain(&orchestrator).await;
    Ok(())
}

/// Stop whatever is running and wait for it to report.
pub async fn drain(orchestrator: &SessionOrchestrator) {
    if orchestrator.stop().await {
        tracing::info!("Waiting for the in-flight session to finish");
    }
    if let Some(summary) = orchestrator.wait_for_completion().await {
        tracing::info!("Last batch: {}", summary.describe());
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested"),
        Err(e) => {
            tracing::error!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await
        }
    }
}
