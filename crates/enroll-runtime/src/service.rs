//! Control surface over the registry, extractor and orchestrator.
//!
//! Every operation takes a session id, bumps the session's activity clock
//! and returns a typed result. Transport layers (HTTP, WebSocket) only ever
//! talk to [`EnrollService`].

use std::sync::Arc;
use std::time::Duration;

use enroll_core::course::CourseRecord;
use enroll_core::events::{EventDraft, EventKind};
use enroll_core::ids::SessionId;
use enroll_core::portal::{AuthProvider, Credentials, PortalClient};
use enroll_settings::EnrollSettings;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{EventBus, Subscription};
use crate::errors::{Result, RuntimeError, StrategyCause};
use crate::extractor::TokenExtractor;
use crate::gateway::{self, ForwardEnd, TransportGateway};
use crate::orchestrator::{Orchestrator, Outcome, PortalSubmit, StopAck, TaskHandle};
use crate::policy::RetryPolicy;
use crate::registry::{CourseTarget, Pending, SessionEvent, SessionRegistry, SessionState};
use crate::task::TaskSnapshot;

/// Courses echoed back from a search.
const MAX_LISTED_COURSES: usize = 5;

/// Result of a sign-on.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// New session id.
    pub session_id: SessionId,
    /// Signed-on principal.
    pub principal: String,
}

/// Result of a search.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    /// Whether any course matched.
    pub has_results: bool,
    /// Number of matching courses.
    pub course_count: usize,
    /// First few matches.
    pub courses: Vec<CourseRecord>,
    /// Class id that will be submitted.
    pub class_id: Option<String>,
    /// Redacted token, when one was acquired.
    pub token_preview: Option<String>,
    /// Whether a submit can be attempted now.
    pub selector_ready: bool,
    /// Per-strategy causes when extraction failed.
    pub extraction_failures: Vec<StrategyCause>,
}

/// Result of a status query.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Session id.
    pub session_id: SessionId,
    /// Signed-on principal.
    pub principal: String,
    /// State machine position.
    pub state: SessionState,
    /// Signed on.
    pub authenticated: bool,
    /// A search has produced a token at least once.
    pub search_ready: bool,
    /// A submit can be attempted now.
    pub selector_ready: bool,
    /// Current target course.
    pub target: Option<CourseTarget>,
    /// Redacted current token.
    pub token_preview: Option<String>,
    /// Search or one-shot submit in flight.
    pub pending: Option<Pending>,
    /// Current or last task.
    pub task: Option<TaskSnapshot>,
    /// Last event sequence number.
    pub last_seq: u64,
}

/// The enroll control surface.
pub struct EnrollService {
    auth: Arc<dyn AuthProvider>,
    portal: Arc<dyn PortalClient>,
    registry: Arc<SessionRegistry>,
    extractor: Arc<TokenExtractor>,
    orchestrator: Arc<Orchestrator>,
    sweep_interval: Duration,
}

impl EnrollService {
    /// Wire a service with the standard extraction chain.
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        portal: Arc<dyn PortalClient>,
        settings: &EnrollSettings,
    ) -> Self {
        let extractor = TokenExtractor::with_defaults(Arc::clone(&portal), &settings.extraction);
        Self::with_extractor(auth, portal, extractor, settings)
    }

    /// Wire a service with a custom extraction chain.
    pub fn with_extractor(
        auth: Arc<dyn AuthProvider>,
        portal: Arc<dyn PortalClient>,
        extractor: TokenExtractor,
        settings: &EnrollSettings,
    ) -> Self {
        let bus = Arc::new(EventBus::new(
            settings.events.ring_capacity,
            settings.events.observer_queue_capacity,
        ));
        let registry = Arc::new(SessionRegistry::new(
            bus,
            &settings.session,
            settings.extraction.min_token_length,
        ));
        let extractor = Arc::new(extractor);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&extractor),
            RetryPolicy::from_settings(&settings.retry),
        ));
        Self {
            auth,
            portal,
            registry,
            extractor,
            orchestrator,
            sweep_interval: Duration::from_millis(settings.session.sweep_interval_ms),
        }
    }

    /// Event bus shared by every session.
    pub fn bus(&self) -> &Arc<EventBus> {
        self.registry.bus()
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Live sessions.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Running auto tasks.
    pub fn running_tasks(&self) -> usize {
        self.orchestrator.running_tasks()
    }

    fn publish(&self, id: &SessionId, draft: EventDraft) {
        let _ = self.bus().publish(id, draft);
    }

    // ── Sessions ──

    /// Sign on and register a session. No session exists on failure.
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn create_session(&self, credentials: &Credentials) -> Result<SessionCreated> {
        let auth = self.auth.authenticate(credentials).await.map_err(|e| {
            warn!(error = %e, "sign-on failed");
            RuntimeError::Auth(e)
        })?;
        let principal = auth.principal.clone();
        let handle = self.registry.create(principal.clone(), auth)?;
        self.publish(
            &handle.id,
            EventDraft::info(EventKind::SessionCreated, format!("signed on as {principal}")),
        );
        Ok(SessionCreated {
            session_id: handle.id.clone(),
            principal,
        })
    }

    /// Tear a session down.
    pub fn destroy_session(&self, id: &SessionId) -> Result<()> {
        self.registry.destroy(id)
    }

    /// Point-in-time view of a session.
    pub fn status(&self, id: &SessionId) -> Result<SessionStatus> {
        let handle = self.registry.require(id)?;
        handle.touch();
        let last_seq = self.bus().last_seq(id).unwrap_or_default();
        let session = handle.lock();
        Ok(SessionStatus {
            session_id: id.clone(),
            principal: session.owner.clone(),
            state: session.state,
            authenticated: session.auth().is_some(),
            search_ready: session.state == SessionState::SearchReady,
            selector_ready: session.selector_ready(self.registry.min_token_len()),
            target: session.target().cloned(),
            token_preview: session.token().map(|t| t.preview()),
            pending: session.pending(),
            task: session.task().map(|t| t.snapshot()),
            last_seq,
        })
    }

    /// Follow a session's events from `after_seq`.
    pub fn subscribe(&self, id: &SessionId, after_seq: u64) -> Result<Subscription> {
        self.registry.require(id)?.touch();
        self.bus().subscribe(id, after_seq)
    }

    /// Pump a session's events after `after_seq` into `observer`. The
    /// session counts as active while the pump runs.
    pub async fn forward<G>(
        &self,
        id: &SessionId,
        after_seq: u64,
        observer: &mut G,
    ) -> Result<ForwardEnd>
    where
        G: TransportGateway + ?Sized,
    {
        let handle = self.registry.require(id)?;
        handle.touch();
        let end = gateway::forward(self.bus(), id, after_seq, observer).await;
        handle.touch();
        end
    }

    // ── Search ──

    /// Search for courses and try to acquire a capability token for the
    /// first match. Refused with `AlreadyRunning` while a submit or an auto
    /// task holds the session, so a running task never sees its target or
    /// token replaced.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn search(&self, id: &SessionId, keyword: &str) -> Result<SearchOutcome> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "keyword must not be empty".into(),
            ));
        }
        let handle = self.registry.require(id)?;
        let _claim = handle.begin(Pending::Search, |session| {
            if session.auth().is_none() {
                return Err(RuntimeError::NotReady("session is not signed on".into()));
            }
            Ok(())
        })?;
        let auth = handle
            .lock()
            .auth()
            .cloned()
            .ok_or_else(|| RuntimeError::NotReady("session is not signed on".into()))?;

        let result = self.portal.search(&auth, keyword).await?;
        if handle.is_closed() {
            return Err(RuntimeError::SessionNotFound(id.clone()));
        }
        let course_count = result.records.len();
        let courses: Vec<CourseRecord> = result
            .records
            .iter()
            .take(MAX_LISTED_COURSES)
            .cloned()
            .collect();

        let Some(first) = result.records.first() else {
            handle.lock().record_search(keyword, result.raw_body);
            let _ = self.registry.transition(id, SessionEvent::TokenCleared)?;
            info!(keyword, "search returned no courses");
            self.publish(
                id,
                EventDraft::warning(
                    EventKind::TokenUnavailable,
                    format!("no courses matched \"{keyword}\""),
                ),
            );
            return Ok(SearchOutcome {
                has_results: false,
                course_count: 0,
                courses,
                class_id: None,
                token_preview: None,
                selector_ready: false,
                extraction_failures: Vec::new(),
            });
        };
        let target = CourseTarget {
            class_id: first.class_id.clone(),
            name: first.name.clone(),
            teacher: first.teacher.clone(),
        };

        let ctx = {
            let mut session = handle.lock();
            session.record_search(keyword, result.raw_body);
            session.extraction_context(self.registry.min_token_len())
        }
        .ok_or_else(|| RuntimeError::NotReady("session is not signed on".into()))?;

        self.publish(
            id,
            EventDraft::info(
                EventKind::SearchCompleted,
                format!("{course_count} course(s) found for \"{keyword}\""),
            )
            .with_payload(json!({ "courseCount": course_count, "classId": target.class_id })),
        );

        match self.extractor.extract(&ctx).await {
            Ok(token) => {
                let preview = token.preview();
                let source = token.source.clone();
                let _ = self.registry.transition(
                    id,
                    SessionEvent::TokenAcquired {
                        token,
                        target: target.clone(),
                    },
                )?;
                debug!(%source, token = %preview, "token stored");
                self.publish(
                    id,
                    EventDraft::info(
                        EventKind::TokenAcquired,
                        format!("capability token acquired via {source}"),
                    )
                    .with_payload(json!({ "source": source, "tokenPreview": preview })),
                );
                Ok(SearchOutcome {
                    has_results: true,
                    course_count,
                    courses,
                    class_id: Some(target.class_id),
                    token_preview: Some(preview),
                    selector_ready: true,
                    extraction_failures: Vec::new(),
                })
            }
            Err(e) => {
                let _ = self.registry.transition(id, SessionEvent::TokenCleared)?;
                warn!(error = %e, "no capability token");
                self.publish(
                    id,
                    EventDraft::warning(EventKind::TokenUnavailable, e.to_string())
                        .with_payload(json!({ "causes": e.causes() })),
                );
                Ok(SearchOutcome {
                    has_results: true,
                    course_count,
                    courses,
                    class_id: Some(target.class_id),
                    token_preview: None,
                    selector_ready: false,
                    extraction_failures: e.causes().to_vec(),
                })
            }
        }
    }

    // ── Select ──

    fn submit_action(&self, id: &SessionId) -> Result<PortalSubmit> {
        let handle = self.registry.require(id)?;
        let session = handle.lock();
        let auth = session
            .auth()
            .cloned()
            .ok_or_else(|| RuntimeError::NotReady("session is not signed on".into()))?;
        let target = session
            .target()
            .cloned()
            .ok_or_else(|| RuntimeError::NotReady("no course selected; search first".into()))?;
        Ok(PortalSubmit::new(Arc::clone(&self.portal), auth, target))
    }

    /// Submit the target course once.
    pub async fn run_once_select(&self, id: &SessionId) -> Result<Outcome> {
        let action = self.submit_action(id)?;
        self.orchestrator.run_once(id, &action).await
    }

    /// Start the auto-retry task for the target course.
    pub fn start_auto_select(&self, id: &SessionId) -> Result<TaskHandle> {
        let action = self.submit_action(id)?;
        self.orchestrator.start_auto(id, Arc::new(action))
    }

    /// Ask the auto task to stop.
    pub fn stop_auto_select(&self, id: &SessionId) -> Result<StopAck> {
        self.orchestrator.stop(id)
    }

    // ── Lifecycle ──

    /// Destroy every session.
    pub fn shutdown(&self) -> usize {
        let destroyed = self.registry.destroy_all();
        info!(destroyed, "enroll service shut down");
        destroyed
    }

    /// Run the idle sweep every `session.sweepIntervalMs` until cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = self.sweep_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = registry.sweep(Instant::now());
                        if !report.expired_sessions.is_empty() {
                            info!(expired = report.expired_sessions.len(), "idle sessions reaped");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}
