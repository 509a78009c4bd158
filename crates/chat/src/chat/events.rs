use medigraph_triage::FailureKind;

use crate::chat::cancellation::Generation;
use crate::session::SessionId;

/// Stream routing key used for stale-chunk rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub generation: Generation,
}

impl StreamTarget {
    pub const fn new(session_id: SessionId, generation: Generation) -> Self {
        Self {
            session_id,
            generation,
        }
    }
}

/// What the ingestion task reports back about its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    /// Decoded text to append to the active turn.
    Delta(String),
    /// The body ended cleanly.
    Done,
    /// The request or its body failed; `message` is the rendered error.
    Failed { kind: FailureKind, message: String },
    /// The token was severed before the body ended.
    Cancelled,
}

/// One report from an ingestion task, tagged with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEvent {
    pub fn new(target: StreamTarget, payload: StreamEventPayload) -> Self {
        Self { target, payload }
    }

    pub fn delta(target: StreamTarget, text: impl Into<String>) -> Self {
        Self::new(target, StreamEventPayload::Delta(text.into()))
    }
}

/// How a turn left the streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(FailureKind),
    Cancelled,
}

/// Result of applying one stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnProgress {
    /// Nothing is streaming.
    Idle,
    /// Text appended to the active turn.
    Delta(String),
    /// The turn left the streaming state.
    Finished(TurnOutcome),
}
