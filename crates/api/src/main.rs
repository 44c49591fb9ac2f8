//! Inspection Server - Main Entry Point

use api::{build_gateway, create_router, init_logging, init_metrics, shutdown_signal, AppState, Cli};
use camera_capture::{CameraManager, SimulatedDeviceFactory};
use clap::Parser;
use inspection::{rule_engine_factory, AppContext, InspectionConfig, Server};
use std::sync::Arc;
use std::time::Duration;
use storage::Repository;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_output.as_deref(), cli.log_json)?;

    info!("=== Inspection Server v{} ===", env!("CARGO_PKG_VERSION"));

    let metrics = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    let config = cli.apply(InspectionConfig::load(cli.config.as_deref())?)?;
    info!(
        "{} boards, {} cameras ({:?})",
        config.boards.len(),
        config.cameras.len(),
        config.camera_type
    );

    // Vendor SDK seam: hardware cameras enumerate through the device factory
    let cameras = CameraManager::from_configs(
        &config.cameras,
        &SimulatedDeviceFactory::new(),
        Duration::from_millis(config.restart_backoff_ms),
    )?;
    let gateway = build_gateway(&config.gateway);
    let engine_factory = rule_engine_factory(config.engine.clone());

    let ctx = Arc::new(AppContext::new(config, Arc::new(Repository::new())));
    let server = Arc::new(Server::new(ctx.clone(), cameras, gateway));
    server.start(engine_factory.as_ref())?;

    let state = Arc::new(AppState::new(ctx, server.cameras().clone(), metrics));
    let app = create_router(state);

    let addr = cli.bind_address();
    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.stop();
    tokio::task::spawn_blocking(move || server.join()).await?;
    Ok(())
}
