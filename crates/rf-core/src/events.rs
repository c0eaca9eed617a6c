//! Execution telemetry event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining clients can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{ExecutionId, JobId};
use crate::job::{ErrorCode, StageName};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Pipeline lifecycle --------------------------------------------------
    PipelineStarted {
        execution_id: ExecutionId,
        job_id: JobId,
    },
    PipelineSucceeded {
        execution_id: ExecutionId,
        job_id: JobId,
        elapsed_ms: u64,
    },
    PipelineFailed {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
        code: ErrorCode,
        message: String,
    },
    PipelineTimedOut {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
    },
    PipelineCancelled {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
    },

    // -- Stage lifecycle -----------------------------------------------------
    StageStarted {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
    },
    StageCompleted {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
        elapsed_ms: u64,
        outputs: usize,
    },
    StageFailed {
        execution_id: ExecutionId,
        job_id: JobId,
        stage: StageName,
        code: ErrorCode,
        message: String,
    },
}

impl EventPayload {
    /// The job this event concerns.
    pub fn job_id(&self) -> &JobId {
        match self {
            EventPayload::PipelineStarted { job_id, .. }
            | EventPayload::PipelineSucceeded { job_id, .. }
            | EventPayload::PipelineFailed { job_id, .. }
            | EventPayload::PipelineTimedOut { job_id, .. }
            | EventPayload::PipelineCancelled { job_id, .. }
            | EventPayload::StageStarted { job_id, .. }
            | EventPayload::StageCompleted { job_id, .. }
            | EventPayload::StageFailed { job_id, .. } => job_id,
        }
    }

    /// Whether this event ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::PipelineSucceeded { .. }
                | EventPayload::PipelineFailed { .. }
                | EventPayload::PipelineTimedOut { .. }
                | EventPayload::PipelineCancelled { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id() -> JobId {
        JobId::parse("job-001").unwrap()
    }

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let execution_id = ExecutionId::new();

        bus.broadcast(EventPayload::PipelineStarted {
            execution_id,
            job_id: job_id(),
        });

        let event = rx.try_recv().unwrap();
        match &event.payload {
            EventPayload::PipelineStarted {
                execution_id: received,
                ..
            } => assert_eq!(*received, execution_id),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        for _ in 0..150 {
            bus.broadcast(EventPayload::StageStarted {
                execution_id: ExecutionId::new(),
                job_id: job_id(),
                stage: StageName::Script,
            });
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        let execution_id = ExecutionId::new();
        bus.broadcast(EventPayload::PipelineStarted {
            execution_id,
            job_id: job_id(),
        });
        bus.broadcast(EventPayload::PipelineTimedOut {
            execution_id,
            job_id: job_id(),
            stage: StageName::Render,
        });

        let recent = bus.recent_events(1);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].payload.is_terminal());
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::PipelineCancelled {
            execution_id: ExecutionId::new(),
            job_id: job_id(),
            stage: StageName::Tts,
        });
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::StageFailed {
            execution_id: ExecutionId::new(),
            job_id: job_id(),
            stage: StageName::Tts,
            code: ErrorCode::StageTimeout,
            message: "stage timed out after 60s".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "stage_failed");
        assert_eq!(json["stage"], "tts");
        assert_eq!(json["code"], "stage_timeout");
        assert_eq!(payload.job_id().as_str(), "job-001");
    }
}
