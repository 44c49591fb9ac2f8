//! Result Image and Metrics Routes

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use image::ImageFormat;
use std::io::Cursor;
use std::sync::Arc;

use crate::{ApiError, AppState};

/// Latest drawn result of one camera and shot as PNG
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path((camera, shot)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    let (frame, label) = {
        let cache = state.ctx.results()?;
        let result = cache
            .current_result(&camera, shot)
            .ok_or_else(|| ApiError::NotFound(format!("no result for {} shot {}", camera, shot)))?;
        (result.frame.clone(), result.label.clone())
    };

    let mut png = Cursor::new(Vec::new());
    frame
        .to_rgb_image()
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| ApiError::Encode(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::HeaderName::from_static("x-inspection-label"), label),
        ],
        png.into_inner(),
    )
        .into_response())
}

/// Prometheus text exposition
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| ApiError::NotFound("metrics recorder not installed".to_string()))
}
