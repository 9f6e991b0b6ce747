//! Browser-facing session endpoints
//!
//! - `GET /session`: create a session, returns its id as plain text
//! - `POST /image`: `{"user_id": 3, "image": "data:image/jpeg;base64,..."}`
//! - `GET /action?user_id=3`: next action (`start`, a song path, or `end`), blocking
//! - `GET /stop?user_id=3`: stop the session's worker at its next step boundary
//!
//! Every failure is a `400` with the generic body (see [`ApiError`]).

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult, Error};
use crate::estimator::Frame;
use crate::session::SessionId;
use crate::AppState;

/// `?user_id=` query of `/action` and `/stop`
#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: SessionId,
}

/// Body of `POST /image`
#[derive(Debug, Deserialize)]
pub struct ImageUpload {
    pub user_id: SessionId,
    /// Data URL (or bare base64) of a JPEG/PNG frame
    pub image: String,
}

/// GET /session
pub async fn create_session(State(state): State<AppState>) -> ApiResult<String> {
    let session_id = state.registry.create_session().await?;
    Ok(session_id.to_string())
}

/// POST /image
///
/// Frames that cannot be decoded are dropped with an empty success response.
pub async fn upload_image(
    State(state): State<AppState>,
    body: Result<Json<ImageUpload>, JsonRejection>,
) -> ApiResult<&'static str> {
    let Json(ImageUpload { user_id, image }) =
        body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (width, height) = state.frame_size;

    let decoded = tokio::task::spawn_blocking(move || decode_frame(&image, width, height)).await;
    match decoded {
        Ok(Ok(frame)) => {
            state.registry.enqueue_frame(user_id, frame).await?;
        }
        Ok(Err(e)) => {
            warn!(session_id = user_id, error = %e, "Dropping undecodable frame");
        }
        Err(e) => {
            warn!(session_id = user_id, error = %e, "Frame decode task failed");
        }
    }
    Ok("")
}

/// GET /action
pub async fn next_action(
    State(state): State<AppState>,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> ApiResult<String> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let action = state.registry.dequeue_action(query.user_id).await?;
    debug!(session_id = query.user_id, action = %action, "Action delivered");
    Ok(action.payload().to_string())
}

/// GET /stop
pub async fn stop_session(
    State(state): State<AppState>,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> ApiResult<&'static str> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.registry.cancel_session(query.user_id).await?;
    Ok("")
}

/// Decode a data URL into an RGB frame of exactly `width` x `height`
pub fn decode_frame(data_url: &str, width: usize, height: usize) -> Result<Frame, Error> {
    let encoded = match data_url.split_once("base64,") {
        Some((_, payload)) => payload,
        None => data_url,
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Decode(format!("Invalid base64: {}", e)))?;

    let image = image::load_from_memory(&bytes)
        .map_err(|e| Error::Decode(format!("Invalid image: {}", e)))?
        .to_rgb8();

    let (w, h) = (width as u32, height as u32);
    let image = if image.dimensions() == (w, h) {
        image
    } else {
        image::imageops::resize(&image, w, h, FilterType::Triangle)
    };

    Frame::new(width, height, image.into_raw())
}

/// Build session routes
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/session", get(create_session))
        .route("/image", post(upload_image))
        .route("/action", get(next_action))
        .route("/stop", get(stop_session))
}
