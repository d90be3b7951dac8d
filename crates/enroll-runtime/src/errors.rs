//! Runtime error types.

use std::fmt;

use enroll_core::errors::{AuthError, PortalError};
use enroll_core::ids::SessionId;
use serde::Serialize;
use thiserror::Error;

use crate::registry::SessionState;

/// Why a single extraction strategy produced no token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CauseKind {
    /// The strategy found nothing.
    Absent,
    /// The strategy found a value that failed the validity predicate.
    Invalid {
        /// Length of the rejected value.
        length: usize,
    },
    /// The strategy itself failed.
    Failed {
        /// Error message.
        message: String,
    },
    /// The strategy exceeded its time budget.
    TimedOut {
        /// Budget that was exceeded.
        timeout_ms: u64,
    },
}

impl CauseKind {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Invalid { .. } => "invalid",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

/// A strategy name with its failure cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyCause {
    /// Strategy name.
    pub strategy: String,
    /// What went wrong.
    pub cause: CauseKind,
}

impl fmt::Display for StrategyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            CauseKind::Absent => write!(f, "{}: no candidate", self.strategy),
            CauseKind::Invalid { length } => {
                write!(f, "{}: rejected candidate of length {length}", self.strategy)
            }
            CauseKind::Failed { message } => write!(f, "{}: {message}", self.strategy),
            CauseKind::TimedOut { timeout_ms } => {
                write!(f, "{}: timed out after {timeout_ms}ms", self.strategy)
            }
        }
    }
}

fn summarize(causes: &[StrategyCause]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of the whole extraction chain. Always recoverable: a later
/// search may change portal state enough for a strategy to succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// Every strategy ran and none produced a valid token.
    #[error("token extraction exhausted ({})", summarize(.causes))]
    Exhausted {
        /// One entry per strategy, in priority order.
        causes: Vec<StrategyCause>,
    },
    /// The aggregate budget ran out before the chain finished.
    #[error("token extraction exceeded {budget_ms}ms ({})", summarize(.causes))]
    DeadlineExceeded {
        /// Aggregate budget.
        budget_ms: u64,
        /// Causes for the strategies that ran.
        causes: Vec<StrategyCause>,
    },
}

impl ExtractionError {
    /// Per-strategy causes collected before the chain gave up.
    pub fn causes(&self) -> &[StrategyCause] {
        match self {
            Self::Exhausted { causes } | Self::DeadlineExceeded { causes, .. } => causes,
        }
    }
}

/// Errors surfaced by the runtime's control operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No live session has this id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// The session already owns a running or stopping task.
    #[error("auto-select already running for session {0}")]
    AlreadyRunning(SessionId),
    /// The session lacks what the operation needs (sign-on, token, target).
    #[error("session not ready: {0}")]
    NotReady(String),
    /// A session transition that would move the state machine backwards.
    #[error("invalid session transition from {from:?} on {event}")]
    InvalidTransition {
        /// State at the time of the request.
        from: SessionState,
        /// Name of the rejected event.
        event: &'static str,
    },
    /// Malformed caller input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Sign-on failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The token chain failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    /// A portal call failed outside a submit attempt.
    #[error(transparent)]
    Portal(#[from] PortalError),
    /// The portal refused the capability token and a refresh did not help.
    #[error("capability token rejected: {0}")]
    TokenInvalid(String),
    /// An attempt failed in a way worth retrying.
    #[error("transient failure: {0}")]
    TransientFailure(String),
    /// An attempt failed in a way that ends the task.
    #[error("fatal failure: {0}")]
    FatalFailure(String),
    /// The work was abandoned because its session went away.
    #[error("cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// Whether the caller can reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Extraction(_) | Self::TransientFailure(_) | Self::TokenInvalid(_) => true,
            Self::Portal(e) => e.is_transient(),
            Self::Auth(AuthError::Unavailable(_)) => true,
            _ => false,
        }
    }

    /// Short machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotReady(_) => "not_ready",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Auth(_) => "auth",
            Self::Extraction(_) => "extraction",
            Self::Portal(_) => "portal",
            Self::TokenInvalid(_) => "token_invalid",
            Self::TransientFailure(_) => "transient",
            Self::FatalFailure(_) => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
