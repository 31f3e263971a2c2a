//! Wiring and lifecycle for the forma service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::capability::CapabilitySet;
use crate::capability::http::HttpCapabilities;
use crate::config::FormaConfig;
use crate::orchestrator::Orchestrator;
use crate::store::TaskStore;

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the forma server and run until Ctrl+C.
pub async fn start_server(config: FormaConfig) -> Result<()> {
    std::fs::create_dir_all(&config.output.dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output.dir.display()
        )
    })?;

    let adapter = HttpCapabilities::new(config.capabilities.clone())
        .context("Failed to initialize capability adapters")?;
    let capabilities = CapabilitySet::over_http(adapter);

    let store = TaskStore::new();
    let orchestrator = Orchestrator::new(
        store.clone(),
        capabilities,
        config.tasks.max_concurrent,
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        orchestrator: Arc::clone(&orchestrator),
        default_max_iterations: config.tasks.max_iterations,
        output_dir: config.output.dir.clone(),
    });

    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    // Retention janitor: terminal tasks stay pollable for the configured
    // window, then get swept.
    let retention = chrono::Duration::seconds(config.tasks.retention_secs as i64);
    let janitor_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let swept = janitor_store.sweep_expired(retention).await;
            if swept > 0 {
                tracing::debug!(swept, "expired tasks swept");
            }
        }
    });

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("forma running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down, cancelling in-flight tasks");
    orchestrator.shutdown();
}
