//! Session status events.
//!
//! Every state transition and failure in a session is mirrored as an
//! [`Event`]. Events carry a per-session sequence number assigned by the
//! event bus, so an observer that reconnects can resume from the last number
//! it saw.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Severity of an event, as shown to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Progress information.
    Info,
    /// A terminal success.
    Success,
    /// A recoverable problem (retry scheduled, stop honored).
    Warning,
    /// A terminal failure.
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Sign-on succeeded and the session was registered.
    SessionCreated,
    /// A course search finished.
    SearchCompleted,
    /// A capability token was stored.
    TokenAcquired,
    /// No usable token could be obtained.
    TokenUnavailable,
    /// An auto-select task was started.
    TaskStarted,
    /// A submit attempt is about to be sent.
    AttemptStarted,
    /// A submit attempt failed and will be retried.
    AttemptRetry,
    /// A one-shot submit was accepted.
    SubmitAccepted,
    /// A one-shot submit failed.
    SubmitRejected,
    /// A stop was requested for the running task.
    StopRequested,
    /// The task honored a stop request.
    TaskStopped,
    /// The task finished with an accepted submit.
    TaskCompleted,
    /// The task ended on a fatal failure.
    TaskFailed,
    /// The session is being torn down.
    SessionClosing,
}

/// An event before the bus has sequenced it.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    /// Severity.
    pub level: EventLevel,
    /// Kind.
    pub kind: EventKind,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    pub payload: Option<serde_json::Value>,
}

impl EventDraft {
    /// Create a draft without payload.
    pub fn new(level: EventLevel, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Shorthand for an info draft.
    pub fn info(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, kind, message)
    }

    /// Shorthand for a warning draft.
    pub fn warning(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Warning, kind, message)
    }
}

/// A sequenced session event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Owning session.
    pub session_id: SessionId,
    /// Per-session sequence number, starting at 1.
    pub seq: u64,
    /// Severity.
    pub level: EventLevel,
    /// Kind.
    pub kind: EventKind,
    /// Human-readable message.
    pub message: String,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// Stamp a draft with its session and sequence number.
    pub fn from_draft(session_id: SessionId, seq: u64, draft: EventDraft) -> Self {
        Self {
            session_id,
            seq,
            level: draft.level,
            kind: draft.kind,
            message: draft.message,
            timestamp: Utc::now(),
            payload: draft.payload,
        }
    }
}
