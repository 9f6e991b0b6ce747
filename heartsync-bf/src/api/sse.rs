//! Session event stream for operators

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;

use crate::config::MODULE_NAME;
use crate::AppState;

/// GET /events
///
/// Streams SessionStarted, SongOffered, StepCompleted, EpisodeFinished,
/// SessionEnded and SessionFailed as they happen.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    heartsync_common::sse::session_event_stream(&state.event_bus, MODULE_NAME)
}
