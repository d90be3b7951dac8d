//! One-shot and auto-retry submission.
//!
//! [`Orchestrator::run_once`] performs a single submit and waits for it.
//! [`Orchestrator::start_auto`] creates the session's single task and spawns
//! one tokio task that loops until the submit is accepted, a fatal failure
//! occurs, the attempt cap is reached, or a stop is honored.
//!
//! Stopping is cooperative: [`Orchestrator::stop`] never interrupts an
//! attempt in flight. It marks the task and cancels the backoff wait, and
//! the loop observes the mark at its next checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use enroll_core::course::SubmitOutcome;
use enroll_core::events::{EventDraft, EventKind, EventLevel};
use enroll_core::ids::{SessionId, TaskId};
use enroll_core::portal::{AuthContext, PortalClient};
use enroll_core::retry::FailureClass;
use enroll_core::token::CapabilityToken;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, RuntimeError};
use crate::extractor::TokenExtractor;
use crate::policy::RetryPolicy;
use crate::registry::{CourseTarget, Pending, Session, SessionHandle, SessionRegistry};
use crate::task::{Task, TaskStatus};

/// A submit that can be repeated with a fresh token.
#[async_trait]
pub trait SelectAction: Send + Sync {
    /// Short description for events and logs.
    fn describe(&self) -> String;

    /// Perform one submit.
    async fn attempt(&self, token: &CapabilityToken) -> SubmitOutcome;
}

/// Submits the session's target course through the portal.
pub struct PortalSubmit {
    portal: Arc<dyn PortalClient>,
    auth: AuthContext,
    target: CourseTarget,
}

impl PortalSubmit {
    /// Bind a portal client to a sign-on and a target.
    pub fn new(portal: Arc<dyn PortalClient>, auth: AuthContext, target: CourseTarget) -> Self {
        Self {
            portal,
            auth,
            target,
        }
    }
}

#[async_trait]
impl SelectAction for PortalSubmit {
    fn describe(&self) -> String {
        format!("{} ({})", self.target.name, self.target.class_id)
    }

    async fn attempt(&self, token: &CapabilityToken) -> SubmitOutcome {
        self.portal
            .submit(&self.auth, &self.target.class_id, token)
            .await
    }
}

/// Result of a one-shot submit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The portal accepted the submit.
    Success {
        /// Portal message.
        message: String,
        /// Submits sent, including a stale-token resend.
        attempts: u32,
    },
    /// The submit failed.
    Failure {
        /// How the failure was classified.
        class: FailureClass,
        /// Portal or local reason.
        reason: String,
    },
}

/// Identifies a started auto task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    /// Task id.
    pub task_id: TaskId,
    /// Owning session.
    pub session_id: SessionId,
}

/// Acknowledgement of a stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAck {
    /// The running task will stop at its next checkpoint.
    Requested,
    /// A stop was already pending.
    AlreadyRequested,
    /// No task is running.
    NotRunning,
}

enum AttemptResult {
    Accepted { message: String, sends: u32 },
    Failed { class: FailureClass, reason: String },
}

impl AttemptResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Failed { class, .. } => class.as_str(),
        }
    }
}

enum Checkpoint {
    Proceed { attempt: u32, wake: CancellationToken },
    Exit,
}

/// Drives submits for every session in a registry. A session has at most
/// one submission in flight: a one-shot holds a [`Pending::Submit`] claim and
/// an auto task counts as busy until it settles.
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    extractor: Arc<TokenExtractor>,
    policy: RetryPolicy,
    running: AtomicUsize,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        registry: Arc<SessionRegistry>,
        extractor: Arc<TokenExtractor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            extractor,
            policy,
            running: AtomicUsize::new(0),
        }
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Auto loops currently running.
    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    fn publish(&self, id: &SessionId, draft: EventDraft) {
        let _ = self.registry.bus().publish(id, draft);
    }

    fn ensure_ready(&self, session: &Session) -> Result<()> {
        if !session.selector_ready(self.registry.min_token_len()) {
            return Err(RuntimeError::NotReady(
                "no valid capability token; search for a course first".into(),
            ));
        }
        Ok(())
    }

    /// Submit exactly once and wait for the result.
    #[instrument(skip(self, action), fields(session_id = %session_id))]
    pub async fn run_once(
        &self,
        session_id: &SessionId,
        action: &dyn SelectAction,
    ) -> Result<Outcome> {
        let handle = self.registry.require(session_id)?;
        let _claim = handle.begin(Pending::Submit, |session| self.ensure_ready(session))?;

        let result = self.bounded_attempt(&handle, action).await;
        counter!("select_attempts_total", "class" => result.label()).increment(1);

        let outcome = match result {
            AttemptResult::Accepted { message, sends } => {
                info!(course = %action.describe(), "submit accepted");
                self.publish(
                    session_id,
                    EventDraft::new(EventLevel::Success, EventKind::SubmitAccepted, &message),
                );
                Outcome::Success {
                    message,
                    attempts: sends,
                }
            }
            AttemptResult::Failed { class, reason } => {
                warn!(course = %action.describe(), %class, %reason, "submit failed");
                self.publish(
                    session_id,
                    EventDraft::new(EventLevel::Error, EventKind::SubmitRejected, &reason)
                        .with_payload(json!({ "class": class, "reason": reason })),
                );
                Outcome::Failure { class, reason }
            }
        };
        Ok(outcome)
    }

    /// Start the session's auto task. At most one task per session may be
    /// running or stopping.
    #[instrument(skip(self, action), fields(session_id = %session_id))]
    pub fn start_auto(
        self: &Arc<Self>,
        session_id: &SessionId,
        action: Arc<dyn SelectAction>,
    ) -> Result<TaskHandle> {
        let handle = self.registry.require(session_id)?;
        let task_id = {
            let mut session = handle.lock();
            if session.is_busy() {
                return Err(RuntimeError::AlreadyRunning(session_id.clone()));
            }
            self.ensure_ready(&session)?;
            let mut task = Task::new(session_id.clone());
            let _ = task.transition(TaskStatus::Running);
            let task_id = task.id.clone();
            session.task = Some(task);
            task_id
        };
        handle.touch();

        self.publish(
            session_id,
            EventDraft::info(
                EventKind::TaskStarted,
                format!("auto-select started for {}", action.describe()),
            )
            .with_payload(json!({
                "taskId": task_id,
                "maxAttempts": self.policy.max_attempts,
            })),
        );
        let running = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("auto_tasks_active").set(running as f64);
        info!(task_id = %task_id, "auto task started");

        let this = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            this.run_loop(handle, action).await;
            let running = this.running.fetch_sub(1, Ordering::Relaxed) - 1;
            gauge!("auto_tasks_active").set(running as f64);
        });

        Ok(TaskHandle {
            task_id,
            session_id: session_id.clone(),
        })
    }

    /// Request a stop. Only the first request on a running task emits an
    /// event.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn stop(&self, session_id: &SessionId) -> Result<StopAck> {
        let handle = self.registry.require(session_id)?;
        handle.touch();
        let ack = {
            let mut session = handle.lock();
            match session.task.as_mut() {
                Some(task) if task.status == TaskStatus::Running => {
                    let _ = task.transition(TaskStatus::StopRequested);
                    task.wake.cancel();
                    StopAck::Requested
                }
                Some(task) if task.status == TaskStatus::StopRequested => {
                    StopAck::AlreadyRequested
                }
                _ => StopAck::NotRunning,
            }
        };
        if ack == StopAck::Requested {
            info!("stop requested");
            self.publish(
                session_id,
                EventDraft::info(
                    EventKind::StopRequested,
                    "stop requested; finishing the current attempt",
                ),
            );
        }
        Ok(ack)
    }

    // ── Loop ──

    async fn run_loop(&self, handle: Arc<SessionHandle>, action: Arc<dyn SelectAction>) {
        let id = handle.id.clone();
        let mut retry_index = 0u32;

        loop {
            let (attempt, wake) = match self.checkpoint(&handle) {
                Checkpoint::Proceed { attempt, wake } => (attempt, wake),
                Checkpoint::Exit => break,
            };

            self.publish(
                &id,
                EventDraft::info(
                    EventKind::AttemptStarted,
                    format!("attempt {attempt}/{}", self.policy.max_attempts),
                )
                .with_payload(json!({ "attempt": attempt })),
            );

            let result = self.bounded_attempt(&handle, action.as_ref()).await;
            counter!("select_attempts_total", "class" => result.label()).increment(1);

            match result {
                AttemptResult::Accepted { message, .. } => {
                    self.finish(&handle, TaskStatus::Completed, None);
                    info!(session_id = %id, attempt, "auto-select completed");
                    self.publish(
                        &id,
                        EventDraft::new(EventLevel::Success, EventKind::TaskCompleted, &message)
                            .with_payload(json!({ "attempts": attempt })),
                    );
                    break;
                }
                AttemptResult::Failed {
                    class: FailureClass::Fatal,
                    reason,
                } => {
                    self.finish(&handle, TaskStatus::Failed, Some(reason.clone()));
                    warn!(session_id = %id, attempt, %reason, "auto-select failed");
                    self.publish(
                        &id,
                        EventDraft::new(EventLevel::Error, EventKind::TaskFailed, &reason)
                            .with_payload(json!({ "attempts": attempt, "class": FailureClass::Fatal })),
                    );
                    break;
                }
                AttemptResult::Failed { reason, .. } => {
                    if attempt >= self.policy.max_attempts {
                        self.fail_on_cap(&handle, attempt);
                        break;
                    }
                    if !self.note_retry(&handle, &reason) {
                        // Stop requested while the attempt was in flight.
                        continue;
                    }
                    let delay = self.policy.delay_for(retry_index);
                    retry_index += 1;
                    debug!(session_id = %id, attempt, delay_ms = delay.as_millis() as u64, %reason, "retry scheduled");
                    self.publish(
                        &id,
                        EventDraft::warning(EventKind::AttemptRetry, &reason).with_payload(json!({
                            "attempt": attempt,
                            "delayMs": delay.as_millis() as u64,
                            "reason": reason,
                        })),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = wake.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Decide whether the loop may send another attempt.
    fn checkpoint(&self, handle: &SessionHandle) -> Checkpoint {
        let closed = handle.is_closed();
        let mut session = handle.lock();
        let Some(task) = session.task.as_mut() else {
            return Checkpoint::Exit;
        };

        if closed {
            let _ = task.finish(TaskStatus::Stopped, Some("cancelled".into()));
            debug!(session_id = %handle.id, "session gone, task cancelled");
            return Checkpoint::Exit;
        }

        match task.status {
            TaskStatus::StopRequested => {
                let _ = task.finish(TaskStatus::Stopped, None);
                let attempts = task.attempts;
                drop(session);
                info!(session_id = %handle.id, attempts, "auto-select stopped");
                self.publish(
                    &handle.id,
                    EventDraft::warning(EventKind::TaskStopped, "auto-select stopped")
                        .with_payload(json!({ "attempts": attempts })),
                );
                Checkpoint::Exit
            }
            TaskStatus::Running => Checkpoint::Proceed {
                attempt: task.record_attempt(),
                wake: task.wake.clone(),
            },
            _ => Checkpoint::Exit,
        }
    }

    fn fail_on_cap(&self, handle: &SessionHandle, attempts: u32) {
        let reason = "attempt limit reached";
        self.finish(handle, TaskStatus::Failed, Some(reason.into()));
        warn!(session_id = %handle.id, attempts, "auto-select gave up");
        self.publish(
            &handle.id,
            EventDraft::new(EventLevel::Error, EventKind::TaskFailed, reason)
                .with_payload(json!({ "attempts": attempts })),
        );
    }

    fn finish(&self, handle: &SessionHandle, to: TaskStatus, reason: Option<String>) {
        if let Some(task) = handle.lock().task.as_mut() {
            let _ = task.finish(to, reason);
        }
    }

    /// Record a retryable failure. Returns false when a stop is pending.
    fn note_retry(&self, handle: &SessionHandle, reason: &str) -> bool {
        let mut session = handle.lock();
        match session.task.as_mut() {
            Some(task) if task.status == TaskStatus::Running => {
                task.last_error = Some(reason.to_owned());
                true
            }
            _ => false,
        }
    }

    // ── Attempts ──

    async fn bounded_attempt(
        &self,
        handle: &SessionHandle,
        action: &dyn SelectAction,
    ) -> AttemptResult {
        let budget = self.policy.attempt_timeout;
        match tokio::time::timeout(budget, self.attempt(handle, action)).await {
            Ok(result) => result,
            Err(_) => AttemptResult::Failed {
                class: FailureClass::Retryable,
                reason: format!("attempt timed out after {}ms", budget.as_millis()),
            },
        }
    }

    async fn attempt(&self, handle: &SessionHandle, action: &dyn SelectAction) -> AttemptResult {
        let token = handle.lock().token.clone();
        let first = match token {
            Some(token) => action.attempt(&token).await,
            None => SubmitOutcome::Rejected("secretVal missing".into()),
        };

        match self.policy.classify(&first) {
            None => AttemptResult::Accepted {
                message: first.message().to_owned(),
                sends: 1,
            },
            Some(FailureClass::StaleToken) => self.recover_stale(handle, action, first.message()).await,
            Some(class) => AttemptResult::Failed {
                class,
                reason: first.message().to_owned(),
            },
        }
    }

    /// Re-extract once and resend once. Failure to recover is retryable.
    async fn recover_stale(
        &self,
        handle: &SessionHandle,
        action: &dyn SelectAction,
        reason: &str,
    ) -> AttemptResult {
        debug!(session_id = %handle.id, %reason, "capability token refused, re-extracting");
        let fold = |cause: String| AttemptResult::Failed {
            class: FailureClass::Retryable,
            reason: format!("{reason} ({cause})"),
        };

        let Some(mut ctx) = handle
            .lock()
            .extraction_context(self.registry.min_token_len())
        else {
            return fold(RuntimeError::Cancelled.to_string());
        };
        // Captured bodies carry the refused token.
        ctx.captured.clear();
        let token = match self.extractor.extract(&ctx).await {
            Ok(token) => token,
            Err(e) => return fold(format!("token refresh failed: {e}")),
        };

        {
            let mut session = handle.lock();
            if handle.is_closed() {
                return fold(RuntimeError::Cancelled.to_string());
            }
            session.token = Some(token.clone());
        }
        self.publish(
            &handle.id,
            EventDraft::info(EventKind::TokenAcquired, "capability token refreshed").with_payload(
                json!({ "source": token.source, "tokenPreview": token.preview() }),
            ),
        );

        let second = action.attempt(&token).await;
        match self.policy.classify(&second) {
            None => AttemptResult::Accepted {
                message: second.message().to_owned(),
                sends: 2,
            },
            Some(FailureClass::StaleToken) => {
                fold(RuntimeError::TokenInvalid(second.message().to_owned()).to_string())
            }
            Some(class) => AttemptResult::Failed {
                class,
                reason: second.message().to_owned(),
            },
        }
    }
}
