//! Server-sent event stream of a job's events.
//!
//! Each frame carries `id: <seq>` and `event: <type>`, so a reconnecting
//! client resumes with `Last-Event-ID` and receives no gaps or duplicates.

use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::metrics::SSE_STREAMS_ACTIVE;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Resume point for clients that cannot set headers
    pub after: Option<u64>,
}

/// Decrements the active-stream gauge when the response stream is dropped
struct StreamGuard;

impl StreamGuard {
    fn new() -> Self {
        SSE_STREAMS_ACTIVE.inc();
        StreamGuard
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        SSE_STREAMS_ACTIVE.dec();
    }
}

fn resume_point(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.after)
        .unwrap_or(0)
}

pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, axum::Error>>>> {
    let ctx = state.context();
    if ctx.ledger.get_job(&job_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Job {} not found", job_id)));
    }

    let after = resume_point(&headers, &query);
    tracing::debug!(job_id = %job_id, after_seq = after, "Event stream opened");

    let guard = StreamGuard::new();
    let stream = ctx.bus.subscribe(job_id, after).map(move |event| {
        let _active = &guard;
        SseEvent::default()
            .id(event.seq.to_string())
            .event(event.payload.event_type())
            .json_data(&event)
    });

    let keepalive = Duration::from_secs(ctx.config.server.sse_keepalive_secs);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive).text("keepalive")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_resume_point_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("7"));
        let query = EventsQuery { after: Some(3) };
        assert_eq!(resume_point(&headers, &query), 7);

        assert_eq!(resume_point(&HeaderMap::new(), &query), 3);
        assert_eq!(resume_point(&HeaderMap::new(), &EventsQuery::default()), 0);

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("garbage"));
        assert_eq!(resume_point(&headers, &EventsQuery::default()), 0);
    }
}
