//! Inspection Server API
//!
//! Thin HTTP control surface over the running inspection server: run
//! status, product and test settings, totals, result images and metrics.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use camera_capture::CameraManager;
use inspection::{AppContext, GatewayConfig, InspectionError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use plc_io::{GatewayKind, IoCard, IoGateway, MemoryDio, ModbusClient};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

pub mod cli;
mod routes;

pub use cli::Cli;

/// Application state shared across handlers
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub cameras: Arc<CameraManager>,
    /// Prometheus recorder handle, absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
    pub version: String,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, cameras: Arc<CameraManager>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            ctx,
            cameras,
            metrics,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Handler errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Image encoding failed: {0}")]
    Encode(String),

    #[error(transparent)]
    Inspection(#[from] InspectionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Encode(_) | ApiError::Inspection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::control::health))
        .route(
            "/api/v1/run-status",
            get(routes::control::get_run_status).put(routes::control::put_run_status),
        )
        .route("/api/v1/product", put(routes::control::put_product))
        .route("/api/v1/test", put(routes::control::put_test))
        .route("/api/v1/totals", get(routes::control::get_totals))
        .route("/api/v1/results/:camera/:shot", get(routes::results::get_result))
        .route("/metrics", get(routes::results::get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Initialize logging
///
/// `level` is a tracing level name. With `output` the log goes to that file
/// instead of stdout.
pub fn init_logging(level: &str, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let level = Level::from_str(level).map_err(|e| anyhow::anyhow!("invalid log level {}: {}", level, e))?;
    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);

    match (output, json) {
        (Some(path), true) => {
            let file = std::fs::File::create(path)?;
            tracing::subscriber::set_global_default(builder.json().with_writer(Mutex::new(file)).finish())?;
        }
        (Some(path), false) => {
            let file = std::fs::File::create(path)?;
            tracing::subscriber::set_global_default(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())?;
        }
        (None, true) => tracing::subscriber::set_global_default(builder.json().finish())?,
        (None, false) => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

/// Install the Prometheus recorder behind `GET /metrics`
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Connect the configured PLC or IO card
///
/// A PLC that is unreachable at start is still returned; the client
/// reconnects on the next register access.
pub fn build_gateway(config: &GatewayConfig) -> Option<Arc<dyn IoGateway>> {
    if !config.enabled {
        info!("No PLC/IO gateway configured");
        return None;
    }
    match config.kind {
        GatewayKind::Plc => {
            let client = ModbusClient::new(&config.plc);
            match client.connect() {
                Ok(()) => info!("Connected to PLC at {}", client.endpoint()),
                Err(e) => warn!("PLC {} not reachable yet: {}", client.endpoint(), e),
            }
            Some(Arc::new(client))
        }
        GatewayKind::IoCard => Some(Arc::new(IoCard::new(
            MemoryDio::new(config.io_card_lines),
            config.io_card_channels,
        ))),
    }
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}
