//! heartsync-bf library interface
//!
//! Closed-loop biofeedback service: browsers stream webcam frames, a
//! per-session estimator turns them into a heart rate, and a decision worker
//! picks which song to offer next. Exposed as a library for integration tests.

pub mod agent;
pub mod api;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod episode;
pub mod error;
pub mod estimator;
pub mod session;

pub use crate::error::{ApiError, ApiResult, Error, Result};

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use heartsync_common::events::EventBus;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Process-wide session coordinator
    pub registry: Arc<SessionRegistry>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Size every uploaded frame is resized to (width, height)
    pub frame_size: (usize, usize),
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        event_bus: EventBus,
        frame_size: (usize, usize),
    ) -> Self {
        Self {
            registry,
            event_bus,
            frame_size,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::session_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
