//! Auto-select task state.

use std::fmt;

use chrono::{DateTime, Utc};
use enroll_core::ids::{SessionId, TaskId};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle of an auto-select task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, loop not yet entered.
    Idle,
    /// Attempts are being made.
    Running,
    /// A stop was requested; the in-flight attempt is allowed to finish.
    StopRequested,
    /// Honored a stop request.
    Stopped,
    /// An attempt was accepted.
    Completed,
    /// Ended on a fatal failure or the attempt cap.
    Failed,
}

impl TaskStatus {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Counts against the single-flight rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::StopRequested)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StopRequested => "stop_requested",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn can_transition_to(self, to: Self) -> bool {
        use TaskStatus::{Completed, Failed, Idle, Running, StopRequested, Stopped};
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, StopRequested | Stopped | Completed | Failed)
                | (StopRequested, Stopped | Completed | Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An auto-select task. Owned by its session and only touched under the
/// session lock.
#[derive(Debug)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Owning session.
    pub session_id: SessionId,
    /// Current status.
    pub status: TaskStatus,
    /// Attempts started so far.
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status or counter change.
    pub updated_at: DateTime<Utc>,
    /// When a terminal status was reached.
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason of the most recent failure.
    pub last_error: Option<String>,
    /// Cancelled on stop or session teardown to cut the backoff wait short.
    pub wake: CancellationToken,
    settled_at: Option<Instant>,
}

impl Task {
    /// A fresh task in `Idle`.
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            session_id,
            status: TaskStatus::Idle,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            last_error: None,
            wake: CancellationToken::new(),
            settled_at: None,
        }
    }

    /// Move to `to` if the lifecycle allows it.
    pub fn transition(&mut self, to: TaskStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(self.updated_at);
            self.settled_at = Some(Instant::now());
        }
        true
    }

    /// Whether the task has been terminal for at least `grace`.
    pub fn settled_longer_than(&self, grace: std::time::Duration, now: Instant) -> bool {
        self.settled_at
            .is_some_and(|at| now.saturating_duration_since(at) >= grace)
    }

    /// Move to a terminal status, recording the reason when one is given.
    pub fn finish(&mut self, to: TaskStatus, reason: Option<String>) -> bool {
        debug_assert!(to.is_terminal());
        if reason.is_some() {
            self.last_error = reason;
        }
        self.transition(to)
    }

    /// Count a new attempt.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.updated_at = Utc::now();
        self.attempts
    }

    /// Serializable view.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            status: self.status,
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of a task.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task id.
    pub task_id: TaskId,
    /// Status.
    pub status: TaskStatus,
    /// Attempts started.
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Terminal time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
