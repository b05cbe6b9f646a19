//! Session endpoints
//!
//! Read-only. The speech loop is the only writer.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::IntervalStream;

use super::{ApiError, ApiState};
use crate::session::SessionState;

/// Latest session snapshot
async fn get_session(State(state): State<Arc<ApiState>>) -> Result<Json<SessionState>, ApiError> {
    state
        .session
        .snapshot()
        .map(|snapshot| Json(SessionState::clone(&snapshot)))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_session",
                "speech loop has not published a session",
            )
        })
}

/// Server-sent events, one per published version
async fn session_events(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(state.event_interval);
    let mut last = None;

    let stream = IntervalStream::new(interval).filter_map(move |_| {
        let event = state.session.snapshot().and_then(|snapshot| {
            let key = (snapshot.session_id, snapshot.version);
            if last == Some(key) {
                return None;
            }
            last = Some(key);
            session_event(&snapshot)
        });
        futures::future::ready(event.map(Ok))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn session_event(snapshot: &SessionState) -> Option<Event> {
    match Event::default()
        .event("session")
        .id(snapshot.version.to_string())
        .json_data(snapshot)
    {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode session event");
            None
        }
    }
}

/// Build session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(get_session))
        .route("/events", get(session_events))
        .with_state(state)
}
