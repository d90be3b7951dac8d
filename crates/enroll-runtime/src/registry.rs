//! Session registry and per-session state machine.
//!
//! Every live session is an `Arc<SessionHandle>` in a `DashMap`. All reads
//! and writes of a session's token and task go through the handle's
//! `parking_lot::Mutex`, which is never held across an `.await`.
//!
//! State only moves forward: `Unauthenticated → Authenticated → SearchReady`.
//! Clearing the token does not regress the state; readiness to submit is the
//! derived [`Session::selector_ready`] predicate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use enroll_core::events::{EventDraft, EventKind};
use enroll_core::ids::SessionId;
use enroll_core::portal::AuthContext;
use enroll_core::token::CapabilityToken;
use enroll_settings::SessionSettings;
use metrics::gauge;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::bus::EventBus;
use crate::errors::{Result, RuntimeError};
use crate::extractor::ExtractionContext;
use crate::task::{Task, TaskStatus};

/// Forward-only session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No sign-on yet.
    Unauthenticated,
    /// Signed on; no token acquired yet.
    Authenticated,
    /// A search produced a token at least once.
    SearchReady,
}

/// The course a session will submit for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseTarget {
    /// Portal class id (`JXBID`).
    pub class_id: String,
    /// Course name.
    pub name: String,
    /// Instructor name.
    pub teacher: String,
}

/// Inputs to [`SessionRegistry::transition`].
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Sign-on succeeded.
    SignedOn(AuthContext),
    /// A valid token was extracted for a target.
    TokenAcquired {
        /// The token.
        token: CapabilityToken,
        /// The course it was extracted for.
        target: CourseTarget,
    },
    /// The token is no longer usable.
    TokenCleared,
}

/// A foreground operation holding a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pending {
    /// A search and token extraction.
    Search,
    /// A one-shot submit.
    Submit,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::SignedOn(_) => "signed_on",
            Self::TokenAcquired { .. } => "token_acquired",
            Self::TokenCleared => "token_cleared",
        }
    }
}

/// Mutable session data. Only reachable through [`SessionHandle::lock`].
#[derive(Debug)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Principal returned by sign-on.
    pub owner: String,
    /// Current state.
    pub state: SessionState,
    pub(crate) auth: Option<AuthContext>,
    pub(crate) token: Option<CapabilityToken>,
    pub(crate) target: Option<CourseTarget>,
    pub(crate) keyword: Option<String>,
    pub(crate) captured: Vec<String>,
    pub(crate) task: Option<Task>,
    pub(crate) pending: Option<Pending>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    pub(crate) last_active: Instant,
}

impl Session {
    fn new(id: SessionId, owner: String) -> Self {
        Self {
            id,
            owner,
            state: SessionState::Unauthenticated,
            auth: None,
            token: None,
            target: None,
            keyword: None,
            captured: Vec::new(),
            task: None,
            pending: None,
            created_at: Utc::now(),
            last_active: Instant::now(),
        }
    }

    /// Apply a state-machine event.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState> {
        let from = self.state;
        let name = event.name();
        match event {
            SessionEvent::SignedOn(auth) => {
                if from != SessionState::Unauthenticated {
                    return Err(RuntimeError::InvalidTransition { from, event: name });
                }
                self.auth = Some(auth);
                self.state = SessionState::Authenticated;
            }
            SessionEvent::TokenAcquired { token, target } => {
                if from < SessionState::Authenticated {
                    return Err(RuntimeError::InvalidTransition { from, event: name });
                }
                self.token = Some(token);
                self.target = Some(target);
                self.state = SessionState::SearchReady;
            }
            SessionEvent::TokenCleared => {
                self.token = None;
            }
        }
        Ok(self.state)
    }

    /// Whether a submit can be attempted right now.
    pub fn selector_ready(&self, min_token_len: usize) -> bool {
        self.auth.is_some()
            && self.target.is_some()
            && self
                .token
                .as_ref()
                .is_some_and(|t| t.is_valid(min_token_len))
    }

    /// Current token, if any.
    pub fn token(&self) -> Option<&CapabilityToken> {
        self.token.as_ref()
    }

    /// Current target, if any.
    pub fn target(&self) -> Option<&CourseTarget> {
        self.target.as_ref()
    }

    /// Sign-on context, until the session is destroyed.
    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    /// The session's task, if one was ever started and not yet reclaimed.
    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    /// Whether a task is running or stopping.
    pub fn has_active_task(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.status.is_active())
    }

    /// Foreground operation in flight, if any.
    pub fn pending(&self) -> Option<Pending> {
        self.pending
    }

    /// Whether an active task or a foreground operation holds the session.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.has_active_task()
    }

    /// Remember the last search for later extraction.
    pub fn record_search(&mut self, keyword: &str, raw_body: String) {
        self.keyword = Some(keyword.to_owned());
        self.captured.clear();
        if !raw_body.is_empty() {
            self.captured.push(raw_body);
        }
    }

    /// Snapshot of what the extractor may read. `None` before sign-on.
    pub fn extraction_context(&self, min_token_len: usize) -> Option<ExtractionContext> {
        Some(ExtractionContext {
            auth: self.auth.clone()?,
            keyword: self.keyword.clone(),
            captured: self.captured.clone(),
            min_token_len,
        })
    }
}

/// Shared handle to a session.
#[derive(Debug)]
pub struct SessionHandle {
    /// Session id.
    pub id: SessionId,
    inner: Mutex<Session>,
    closed: AtomicBool,
}

impl SessionHandle {
    /// Enter the session's critical section.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock()
    }

    /// Whether the session was destroyed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session as used.
    pub fn touch(&self) {
        self.inner.lock().last_active = Instant::now();
    }

    /// Claim the session for `op` until the guard drops. `check` runs in the
    /// same critical section after the busy check.
    pub fn begin(
        self: &Arc<Self>,
        op: Pending,
        check: impl FnOnce(&Session) -> Result<()>,
    ) -> Result<PendingGuard> {
        let mut session = self.lock();
        if session.is_busy() {
            return Err(RuntimeError::AlreadyRunning(self.id.clone()));
        }
        check(&session)?;
        session.pending = Some(op);
        session.last_active = Instant::now();
        Ok(PendingGuard {
            handle: Arc::clone(self),
        })
    }
}

/// Releases a session claimed by [`SessionHandle::begin`].
#[derive(Debug)]
pub struct PendingGuard {
    handle: Arc<SessionHandle>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut session = self.handle.lock();
        session.pending = None;
        session.last_active = Instant::now();
    }
}

/// What a sweep did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Terminal tasks dropped after their grace period.
    pub reclaimed_tasks: usize,
    /// Sessions destroyed for inactivity.
    pub expired_sessions: Vec<SessionId>,
}

/// Owner of every live session.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    bus: Arc<EventBus>,
    idle_timeout: Duration,
    task_grace: Duration,
    min_token_len: usize,
}

impl SessionRegistry {
    /// Create an empty registry publishing to `bus`.
    pub fn new(bus: Arc<EventBus>, settings: &SessionSettings, min_token_len: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            bus,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
            task_grace: Duration::from_millis(settings.task_grace_ms),
            min_token_len,
        }
    }

    /// The bus sessions publish to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Validity threshold for tokens.
    pub fn min_token_len(&self) -> usize {
        self.min_token_len
    }

    /// Register a signed-on session and open its event topic.
    #[instrument(skip(self, auth), fields(owner = %owner))]
    pub fn create(&self, owner: String, auth: AuthContext) -> Result<Arc<SessionHandle>> {
        let id = SessionId::new();
        let mut session = Session::new(id.clone(), owner);
        let _ = session.apply(SessionEvent::SignedOn(auth))?;

        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            inner: Mutex::new(session),
            closed: AtomicBool::new(false),
        });
        self.bus.open(&id);
        let _ = self.sessions.insert(id.clone(), Arc::clone(&handle));
        self.record_gauge();
        info!(session_id = %id, "session created");
        Ok(handle)
    }

    /// Look up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|h| Arc::clone(h.value()))
    }

    /// Look up a live session or fail with `SessionNotFound`.
    pub fn require(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.get(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.clone()))
    }

    /// Apply a state-machine event to a session.
    pub fn transition(&self, id: &SessionId, event: SessionEvent) -> Result<SessionState> {
        let handle = self.require(id)?;
        let mut session = handle.lock();
        let from = session.state;
        let to = session.apply(event)?;
        if from != to {
            debug!(session_id = %id, ?from, ?to, "session transition");
        }
        Ok(to)
    }

    /// Tear a session down: request a stop for its task, close its topic,
    /// then release its sign-on and token.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn destroy(&self, id: &SessionId) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.clone()))?;
        handle.closed.store(true, Ordering::Release);

        {
            let mut session = handle.lock();
            if let Some(task) = session.task.as_mut()
                && task.status == TaskStatus::Running
            {
                let _ = task.transition(TaskStatus::StopRequested);
            }
            if let Some(task) = session.task.as_ref() {
                task.wake.cancel();
            }
        }

        let _ = self.bus.publish(
            id,
            EventDraft::info(EventKind::SessionClosing, "session closing"),
        );
        self.bus.close(id);

        {
            let mut session = handle.lock();
            session.auth = None;
            session.token = None;
            session.captured.clear();
        }

        self.record_gauge();
        info!("session destroyed");
        Ok(())
    }

    /// Destroy every session.
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.destroy(id).is_ok()).count()
    }

    /// Reclaim settled tasks and destroy idle sessions that are neither busy
    /// nor watched by an observer.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        for handle in handles {
            let watched = self.bus.observer_count(&handle.id) > 0;
            let mut session = handle.lock();
            if session
                .task
                .as_ref()
                .is_some_and(|t| t.settled_longer_than(self.task_grace, now))
            {
                session.task = None;
                report.reclaimed_tasks += 1;
            }
            let idle = now.saturating_duration_since(session.last_active);
            if idle >= self.idle_timeout && !session.is_busy() && !watched {
                report.expired_sessions.push(handle.id.clone());
            }
        }

        for id in &report.expired_sessions {
            info!(session_id = %id, "session idle, expiring");
            let _ = self.destroy(id);
        }
        if report.reclaimed_tasks > 0 || !report.expired_sessions.is_empty() {
            debug!(
                reclaimed = report.reclaimed_tasks,
                expired = report.expired_sessions.len(),
                "sweep finished"
            );
        }
        report
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn record_gauge(&self) {
        gauge!("sessions_active").set(self.sessions.len() as f64);
    }
}
