//! Server-Sent Events (SSE) stream of execution telemetry.
//!
//! Subscribes to the [`rf_core::events::EventBus`], optionally filters by
//! job, replays recent events for late joiners, and sends keepalive
//! heartbeats.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::context::AppContext;

/// Events replayed to a new subscriber.
const REPLAY: usize = 50;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only stream events for this job.
    pub job_id: Option<String>,
}

/// GET /api/events
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let job_filter = params.job_id;

    let recent = ctx.event_bus.recent_events(REPLAY);
    let mut rx = ctx.event_bus.subscribe();

    let stream = async_stream::stream! {
        for event in recent.into_iter().rev() {
            if matches_job(&event.payload, &job_filter) {
                if let Ok(data) = serde_json::to_string(&event) {
                    yield Ok(Event::default().data(data));
                }
            }
        }

        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if matches_job(&event.payload, &job_filter) {
                                if let Ok(data) = serde_json::to_string(&event) {
                                    yield Ok(Event::default().data(data));
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("SSE client lagged by {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(r#"{"type":"heartbeat"}"#));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn matches_job(payload: &rf_core::events::EventPayload, filter: &Option<String>) -> bool {
    match filter {
        Some(job_id) => payload.job_id().as_str() == job_id,
        None => true,
    }
}
