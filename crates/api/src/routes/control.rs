//! Run Control Routes

use axum::{extract::State, Json};
use inspection::context::{BoardCounters, DisplayTotals};
use inspection::{ProductSettings, RunStatus, TestSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::{ApiError, AppState};

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub run_status: RunStatus,
    pub product: String,
    pub cameras: Vec<CameraHealth>,
}

#[derive(Debug, Serialize)]
pub struct CameraHealth {
    pub name: String,
    pub started: bool,
    pub total_frames: u64,
    pub last_error: Option<String>,
}

/// Health check handler
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let cameras = state
        .cameras
        .names()
        .into_iter()
        .filter_map(|name| state.cameras.get(&name))
        .map(|camera| CameraHealth {
            name: camera.name().to_string(),
            started: camera.is_started(),
            total_frames: camera.total_frames(),
            last_error: camera.last_error(),
        })
        .collect();

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        run_status: state.ctx.run_status(),
        product: state.ctx.product_settings()?.product,
        cameras,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RunStatusRequest {
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub status: RunStatus,
    pub code: i32,
}

impl From<RunStatus> for RunStatusResponse {
    fn from(status: RunStatus) -> Self {
        Self {
            status,
            code: status.code(),
        }
    }
}

pub async fn get_run_status(State(state): State<Arc<AppState>>) -> Json<RunStatusResponse> {
    Json(state.ctx.run_status().into())
}

pub async fn put_run_status(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunStatusRequest>,
) -> Json<RunStatusResponse> {
    state.ctx.set_run_status(request.status);
    Json(request.status.into())
}

/// Replace the product settings; a new product name resets the running totals
pub async fn put_product(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<ProductSettings>,
) -> Result<Json<ProductSettings>, ApiError> {
    info!("Product settings update: {} lot {}", settings.product, settings.lot);
    state.ctx.set_product_settings(settings.clone())?;
    Ok(Json(settings))
}

pub async fn put_test(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<TestSettings>,
) -> Result<Json<TestSettings>, ApiError> {
    let boards = state.ctx.config.boards.len();
    if settings.board >= boards {
        return Err(ApiError::BadRequest(format!(
            "board {} out of range ({} boards)",
            settings.board, boards
        )));
    }
    state.ctx.set_test_settings(settings.clone())?;
    Ok(Json(settings))
}

/// Response for totals endpoint
#[derive(Debug, Serialize)]
pub struct TotalsResponse {
    pub total: u64,
    pub total_defect: u64,
    pub boards: Vec<BoardCounters>,
    /// Totals last published by the merge-total thread
    pub display: DisplayTotals,
    pub defect_indices: Vec<u64>,
}

pub async fn get_totals(State(state): State<Arc<AppState>>) -> Result<Json<TotalsResponse>, ApiError> {
    let running = state.ctx.running_data()?;
    let (display, defect_indices) = {
        let cache = state.ctx.results()?;
        (cache.display_totals(), cache.defect_indices().to_vec())
    };
    Ok(Json(TotalsResponse {
        total: running.total,
        total_defect: running.total_defect,
        boards: running.boards,
        display,
        defect_indices,
    }))
}
