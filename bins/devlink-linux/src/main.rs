use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devlink_core::FileConfigStorage;
use devlink_plugins::{builtin_plugins, PanelStore};
use devlink_runtime::{NmcliDetector, NmcliJoiner, Shell, ShellSeams};

mod api;
mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,devlink_runtime=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("devlink starting...");

    let dir = settings::config_dir();
    let config = settings::load(&settings::config_path(&dir))?;
    let storage = FileConfigStorage::new(&dir)
        .with_context(|| format!("Cannot use config directory {}", dir.display()))?;

    let mut seams = ShellSeams::new(Arc::new(storage));
    if config.network.nmcli {
        seams = seams
            .with_joiner(Arc::new(NmcliJoiner::new(config.network.interface.clone())))
            .with_detector(Arc::new(NmcliDetector));
    }

    let panels = PanelStore::new();
    let shell = Arc::new(Shell::start(
        config.runtime.clone(),
        seams,
        builtin_plugins(&panels),
    )?);

    match shell.reconnect_last().await {
        Ok(Some(id)) => tracing::info!("Connected to {}", id),
        Ok(None) => tracing::info!("No device selected yet"),
        Err(e) => tracing::warn!("Could not reach last device: {}", e),
    }

    let app = api::create_router(api::AppState {
        shell: shell.clone(),
        panels,
    })
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.http.bind).await?;
    tracing::info!("HTTP API listening on http://{}/api", config.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Received Ctrl+C, shutting down...");
        })
        .await?;

    shell.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
