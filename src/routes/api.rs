//! Read-only JSON API over the live canvas.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::warn;

use crate::canvas::ActivePixel;
use crate::protocol::{CanvasInfo, SessionStats};
use crate::services::pixel::EditError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsBody {
    #[serde(flatten)]
    pub session: SessionStats,
    /// `None` when storage could not be queried.
    pub database: Option<DatabaseStats>,
}

#[derive(Serialize)]
pub struct DatabaseStats {
    pub total_pixels: i64,
    pub active_pixels: i64,
    pub pending_batch_size: usize,
}

#[derive(Serialize)]
pub struct CanvasBody {
    pub pixels: Arc<[ActivePixel]>,
    pub canvas_info: CanvasInfo,
}

#[derive(Debug, Serialize)]
pub struct PixelBody {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub last_update: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize)]
pub struct ColorsBody {
    pub colors: Vec<String>,
    pub default_color: String,
    pub enforce_palette: bool,
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> Json<StatsBody> {
    let session = state.session_stats(None);
    let database = match state.persistence.repo_stats().await {
        Ok(db) => Some(DatabaseStats {
            total_pixels: db.total_pixels,
            active_pixels: db.active_pixels,
            pending_batch_size: session.persistence.pending_writes,
        }),
        Err(e) => {
            warn!(error = %e, "api: storage stats unavailable");
            None
        }
    };
    Json(StatsBody { session, database })
}

/// `GET /api/canvas`
pub async fn canvas(State(state): State<AppState>) -> Json<CanvasBody> {
    let pixels = state.lock_canvas().active_pixels();
    Json(CanvasBody { pixels, canvas_info: state.canvas_info() })
}

/// `GET /api/pixel/{x}/{y}`
pub async fn pixel(
    State(state): State<AppState>,
    Path((x, y)): Path<(i64, i64)>,
) -> Result<Json<PixelBody>, (StatusCode, Json<ErrorBody>)> {
    let canvas = state.lock_canvas();
    if canvas.coord(x, y).is_none() {
        return Err((StatusCode::BAD_REQUEST, Json(ErrorBody { error: EditError::OutOfBounds.to_string() })));
    }
    let pixel = canvas.get_pixel(x, y);
    Ok(Json(PixelBody { x, y, color: pixel.color, last_update: pixel.last_update }))
}

/// `GET /api/colors`
pub async fn colors(State(state): State<AppState>) -> Json<ColorsBody> {
    let canvas = &state.config.canvas;
    Json(ColorsBody {
        colors: canvas.colors.clone(),
        default_color: canvas.default_color.clone(),
        enforce_palette: canvas.enforce_palette,
    })
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
