//! End-to-end runtime scenarios over in-memory collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use enroll_core::course::{CourseRecord, SearchResult, SubmitOutcome};
use enroll_core::errors::{AuthError, PortalError};
use enroll_core::events::{Event, EventKind, EventLevel};
use enroll_core::ids::SessionId;
use enroll_core::portal::{AuthContext, AuthProvider, Credentials, PortalClient};
use enroll_core::retry::FailureClass;
use enroll_core::token::CapabilityToken;
use enroll_runtime::bus::Subscription;
use enroll_runtime::gateway::{ForwardEnd, TransportError, TransportGateway};
use enroll_runtime::orchestrator::{Outcome, StopAck};
use enroll_runtime::registry::Pending;
use enroll_runtime::task::TaskStatus;
use enroll_runtime::{EnrollService, RuntimeError};
use enroll_settings::EnrollSettings;
use parking_lot::Mutex;

// ── Fakes ──

struct FakeAuth;

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext, AuthError> {
        if credentials.password != "correct" {
            return Err(AuthError::Rejected("用户名或密码错误".into()));
        }
        Ok(AuthContext {
            principal: credentials.username.clone(),
            bearer: "bearer-token".into(),
            batch_id: "BATCH-1".into(),
            issued_at: Utc::now(),
        })
    }
}

struct FakePortal {
    records: Mutex<Vec<CourseRecord>>,
    secret: Mutex<String>,
    script: Mutex<VecDeque<SubmitOutcome>>,
    fallback: SubmitOutcome,
    submit_delay: Duration,
    search_delay: Duration,
    submits_started: AtomicUsize,
    submits_finished: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    tokens_seen: Mutex<Vec<String>>,
    classes_seen: Mutex<Vec<String>>,
}

impl FakePortal {
    fn new(script: Vec<SubmitOutcome>) -> Self {
        Self {
            records: Mutex::new(vec![course("202520261001", "Compilers")]),
            secret: Mutex::new("S".repeat(48)),
            script: Mutex::new(script.into()),
            fallback: SubmitOutcome::Transient("课容量已满".into()),
            submit_delay: Duration::ZERO,
            search_delay: Duration::ZERO,
            submits_started: AtomicUsize::new(0),
            submits_finished: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            tokens_seen: Mutex::new(Vec::new()),
            classes_seen: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = delay;
        self
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn started(&self) -> usize {
        self.submits_started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.submits_finished.load(Ordering::SeqCst)
    }
}

fn course(id: &str, name: &str) -> CourseRecord {
    CourseRecord {
        class_id: id.into(),
        name: name.into(),
        teacher: "Zhang".into(),
        secret_val: None,
    }
}

#[async_trait]
impl PortalClient for FakePortal {
    async fn search(&self, _auth: &AuthContext, _keyword: &str) -> Result<SearchResult, PortalError> {
        if !self.search_delay.is_zero() {
            tokio::time::sleep(self.search_delay).await;
        }
        let secret = self.secret.lock().clone();
        let records: Vec<CourseRecord> = self
            .records
            .lock()
            .iter()
            .cloned()
            .map(|mut r| {
                r.secret_val = Some(secret.clone());
                r
            })
            .collect();
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| serde_json::json!({"JXBID": r.class_id, "KCM": r.name, "secretVal": secret}))
            .collect();
        let raw_body = serde_json::json!({"code": 200, "data": {"rows": rows}}).to_string();
        Ok(SearchResult { records, raw_body })
    }

    async fn submit(
        &self,
        _auth: &AuthContext,
        course_id: &str,
        token: &CapabilityToken,
    ) -> SubmitOutcome {
        let _ = self.submits_started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.tokens_seen.lock().push(token.value().to_owned());
        self.classes_seen.lock().push(course_id.to_owned());
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = self.submits_finished.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn landing_page(&self, _auth: &AuthContext) -> Result<String, PortalError> {
        Ok("<html><body>nothing here</body></html>".into())
    }
}

struct CountingGateway {
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportGateway for CountingGateway {
    async fn push(&mut self, _event: &Event) -> Result<(), TransportError> {
        let _ = self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ──

fn settings() -> EnrollSettings {
    let mut settings = EnrollSettings::default();
    settings.retry.jitter_factor = 0.0;
    settings
}

fn service_with(portal: Arc<FakePortal>, settings: &EnrollSettings) -> Arc<EnrollService> {
    Arc::new(EnrollService::new(Arc::new(FakeAuth), portal, settings))
}

async fn ready_session(service: &EnrollService) -> SessionId {
    let created = service
        .create_session(&Credentials::new("20231234", "correct"))
        .await
        .unwrap();
    let outcome = service.search(&created.session_id, "compilers").await.unwrap();
    assert!(outcome.selector_ready);
    created.session_id
}

/// Collect events until `stop` appears (inclusive).
async fn events_until(sub: &mut Subscription, stop: EventKind) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), sub.next())
            .await
            .expect("event before timeout")
            .expect("topic open");
        let done = event.kind == stop;
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Collect whatever is already retained or arrives promptly.
async fn drain(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(10), sub.next()).await {
        events.push(event);
    }
    events
}

fn task_status(service: &EnrollService, id: &SessionId) -> TaskStatus {
    service.status(id).unwrap().task.unwrap().status
}

// ── Sign-on ──

#[tokio::test]
async fn rejected_sign_on_creates_no_session() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let err = service
        .create_session(&Credentials::new("20231234", "wrong"))
        .await
        .unwrap_err();
    assert_matches!(err, RuntimeError::Auth(AuthError::Rejected(_)));
    assert_eq!(service.active_sessions(), 0);
}

#[tokio::test]
async fn search_acquires_token_via_passive_capture() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let created = service
        .create_session(&Credentials::new("20231234", "correct"))
        .await
        .unwrap();
    let outcome = service.search(&created.session_id, "compilers").await.unwrap();
    assert!(outcome.has_results);
    assert_eq!(outcome.course_count, 1);
    assert_eq!(outcome.class_id.as_deref(), Some("202520261001"));
    assert_eq!(outcome.token_preview.as_deref(), Some("SSSSSSSS…"));

    let status = service.status(&created.session_id).unwrap();
    assert!(status.authenticated && status.search_ready && status.selector_ready);

    let mut sub = service.subscribe(&created.session_id, 0).unwrap();
    let kinds: Vec<EventKind> = drain(&mut sub).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::SessionCreated, EventKind::SearchCompleted, EventKind::TokenAcquired]
    );
}

#[tokio::test]
async fn empty_keyword_rejected() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let created = service
        .create_session(&Credentials::new("20231234", "correct"))
        .await
        .unwrap();
    assert_matches!(
        service.search(&created.session_id, "   ").await,
        Err(RuntimeError::InvalidRequest(_))
    );
}

// ── Readiness ──

#[tokio::test]
async fn zero_records_means_not_ready() {
    let portal = Arc::new(FakePortal::new(vec![]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    portal.records.lock().clear();
    let outcome = service.search(&id, "nothing").await.unwrap();
    assert!(!outcome.has_results);
    assert!(!outcome.selector_ready);

    let status = service.status(&id).unwrap();
    assert!(!status.selector_ready);
    assert!(status.search_ready);

    assert_matches!(service.run_once_select(&id).await, Err(RuntimeError::NotReady(_)));
    assert_matches!(service.start_auto_select(&id), Err(RuntimeError::NotReady(_)));
    assert_eq!(portal.started(), 0);
}

#[tokio::test]
async fn extraction_failure_reports_every_strategy() {
    let portal = Arc::new(FakePortal::new(vec![]));
    *portal.secret.lock() = "short".into();
    let service = service_with(Arc::clone(&portal), &settings());
    let created = service
        .create_session(&Credentials::new("20231234", "correct"))
        .await
        .unwrap();

    let outcome = service.search(&created.session_id, "compilers").await.unwrap();
    assert!(outcome.has_results);
    assert!(!outcome.selector_ready);
    let strategies: Vec<&str> = outcome
        .extraction_failures
        .iter()
        .map(|c| c.strategy.as_str())
        .collect();
    assert_eq!(strategies, vec!["passive_capture", "active_request", "state_scan"]);
    assert!(service.status(&created.session_id).unwrap().token_preview.is_none());
}

// ── One-shot ──

#[tokio::test]
async fn run_once_submits_exactly_once() {
    let portal = Arc::new(FakePortal::new(vec![SubmitOutcome::Rejected("课容量已满".into())]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let outcome = service.run_once_select(&id).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Failure {
            class: FailureClass::Retryable,
            reason: "课容量已满".into()
        }
    );
    assert_eq!(portal.started(), 1);
}

#[tokio::test]
async fn stale_token_is_refreshed_once() {
    let portal = Arc::new(FakePortal::new(vec![
        SubmitOutcome::Rejected("secretVal 已失效".into()),
        SubmitOutcome::Accepted("选课成功".into()),
    ]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;
    let before = service.bus().last_seq(&id).unwrap();

    *portal.secret.lock() = "R".repeat(48);
    let outcome = service.run_once_select(&id).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Success {
            message: "选课成功".into(),
            attempts: 2
        }
    );
    let seen = portal.tokens_seen.lock().clone();
    assert_eq!(seen, vec!["S".repeat(48), "R".repeat(48)]);

    let mut sub = service.subscribe(&id, before).unwrap();
    let kinds: Vec<EventKind> = drain(&mut sub).await.into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::TokenAcquired, EventKind::SubmitAccepted]);
}

#[tokio::test]
async fn repeated_stale_token_folds_into_retryable() {
    let portal = Arc::new(FakePortal::new(vec![
        SubmitOutcome::Rejected("非法请求".into()),
        SubmitOutcome::Rejected("非法请求".into()),
    ]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let outcome = service.run_once_select(&id).await.unwrap();
    assert_matches!(outcome, Outcome::Failure { class: FailureClass::Retryable, reason } => {
        assert!(reason.starts_with("非法请求"));
    });
    assert_eq!(portal.started(), 2);
}

// ── Auto ──

#[tokio::test(start_paused = true)]
async fn transient_transient_success_completes() {
    let portal = Arc::new(FakePortal::new(vec![
        SubmitOutcome::Transient("HTTP 503".into()),
        SubmitOutcome::Rejected("课容量已满".into()),
        SubmitOutcome::Accepted("选课成功".into()),
    ]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;
    let before = service.bus().last_seq(&id).unwrap();
    let mut sub = service.subscribe(&id, before).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    let events = events_until(&mut sub, EventKind::TaskCompleted).await;

    let levels: Vec<EventLevel> = events
        .iter()
        .map(|e| e.level)
        .filter(|l| matches!(l, EventLevel::Warning | EventLevel::Success))
        .collect();
    assert_eq!(levels, vec![EventLevel::Warning, EventLevel::Warning, EventLevel::Success]);
    assert_eq!(events[0].kind, EventKind::TaskStarted);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    let retry = events.iter().find(|e| e.kind == EventKind::AttemptRetry).unwrap();
    let payload = retry.payload.as_ref().unwrap();
    assert_eq!(payload["attempt"], 1);
    assert_eq!(payload["delayMs"], 1000);

    assert_eq!(portal.started(), 3);
    assert_eq!(task_status(&service, &id), TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn attempt_cap_fails_task() {
    let portal = Arc::new(FakePortal::new(vec![]));
    let mut settings = settings();
    settings.retry.max_attempts = 3;
    let service = service_with(Arc::clone(&portal), &settings);
    let id = ready_session(&service).await;
    let mut sub = service.subscribe(&id, 0).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    let events = events_until(&mut sub, EventKind::TaskFailed).await;
    let failed = events.last().unwrap();
    assert_eq!(failed.level, EventLevel::Error);
    assert_eq!(failed.message, "attempt limit reached");
    assert_eq!(portal.started(), 3);

    let task = service.status(&id).unwrap().task.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn fatal_rejection_ends_task() {
    let portal = Arc::new(FakePortal::new(vec![SubmitOutcome::Rejected("时间冲突".into())]));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;
    let mut sub = service.subscribe(&id, 0).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    let events = events_until(&mut sub, EventKind::TaskFailed).await;
    assert!(events.iter().all(|e| e.kind != EventKind::AttemptRetry));
    assert_eq!(events.last().unwrap().message, "时间冲突");
    assert_eq!(portal.started(), 1);
    assert_eq!(task_status(&service, &id), TaskStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_is_single_flight() {
    let portal = Arc::new(FakePortal::new(vec![]).with_delay(Duration::from_secs(3600)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let mut joins = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&service);
        let id = id.clone();
        joins.push(tokio::spawn(async move { service.start_auto_select(&id) }));
    }
    let mut accepted = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_matches!(e, RuntimeError::AlreadyRunning(_)),
        }
    }
    assert_eq!(accepted, 1);
    assert_matches!(service.run_once_select(&id).await, Err(RuntimeError::AlreadyRunning(_)));
    let _ = service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn run_once_holds_the_session_until_it_returns() {
    let portal = Arc::new(FakePortal::new(vec![]).with_delay(Duration::from_millis(500)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let once = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.run_once_select(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.status(&id).unwrap().pending, Some(Pending::Submit));

    assert_matches!(service.start_auto_select(&id), Err(RuntimeError::AlreadyRunning(_)));
    assert_matches!(service.run_once_select(&id).await, Err(RuntimeError::AlreadyRunning(_)));
    assert_matches!(service.search(&id, "compilers").await, Err(RuntimeError::AlreadyRunning(_)));

    assert_matches!(once.await.unwrap(), Ok(Outcome::Failure { .. }));
    assert_eq!(portal.started(), 1);
    assert_eq!(portal.max_in_flight(), 1);
    assert!(service.status(&id).unwrap().pending.is_none());
    assert!(service.start_auto_select(&id).is_ok());
    let _ = service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn search_refused_while_auto_runs() {
    let portal = Arc::new(FakePortal::new(vec![]).with_delay(Duration::from_millis(500)));
    *portal.records.lock() = vec![course("C1", "Compilers")];
    *portal.secret.lock() = "X".repeat(48);
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let _ = service.start_auto_select(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    *portal.records.lock() = vec![course("C2", "Databases")];
    *portal.secret.lock() = "Y".repeat(48);
    assert_matches!(service.search(&id, "databases").await, Err(RuntimeError::AlreadyRunning(_)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = service.status(&id).unwrap();
    assert_eq!(status.target.unwrap().class_id, "C1");
    assert_eq!(status.token_preview.as_deref(), Some("XXXXXXXX…"));

    let classes = portal.classes_seen.lock().clone();
    let tokens = portal.tokens_seen.lock().clone();
    assert!(classes.len() >= 2);
    assert!(classes.iter().all(|c| c == "C1"));
    assert!(tokens.iter().all(|t| *t == "X".repeat(48)));
    assert_eq!(portal.max_in_flight(), 1);
    let _ = service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn auto_start_refused_during_search() {
    let portal = Arc::new(FakePortal::new(vec![]).with_search_delay(Duration::from_millis(500)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let search = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.search(&id, "compilers").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.status(&id).unwrap().pending, Some(Pending::Search));
    assert_matches!(service.start_auto_select(&id), Err(RuntimeError::AlreadyRunning(_)));
    assert_matches!(service.run_once_select(&id).await, Err(RuntimeError::AlreadyRunning(_)));

    assert!(search.await.unwrap().unwrap().selector_ready);
    assert_eq!(portal.started(), 0);
    assert!(service.start_auto_select(&id).is_ok());
    let _ = service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stop_lets_attempt_finish_and_suppresses_next() {
    let portal = Arc::new(FakePortal::new(vec![]).with_delay(Duration::from_millis(500)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;
    let mut sub = service.subscribe(&id, 0).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(portal.started(), 1);
    assert_eq!(portal.finished(), 0);

    assert_eq!(service.stop_auto_select(&id).unwrap(), StopAck::Requested);
    assert_eq!(task_status(&service, &id), TaskStatus::StopRequested);
    assert_eq!(service.stop_auto_select(&id).unwrap(), StopAck::AlreadyRequested);

    let events = events_until(&mut sub, EventKind::TaskStopped).await;
    assert_eq!(events.last().unwrap().level, EventLevel::Warning);
    assert_eq!(portal.finished(), 1);
    assert_eq!(portal.started(), 1);
    assert_eq!(task_status(&service, &id), TaskStatus::Stopped);

    // Further stops are no-ops without events.
    assert_eq!(service.stop_auto_select(&id).unwrap(), StopAck::NotRunning);
    assert_eq!(service.stop_auto_select(&id).unwrap(), StopAck::NotRunning);
    let mut replay = service.subscribe(&id, 0).unwrap();
    let all = drain(&mut replay).await;
    let count = |kind| all.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::StopRequested), 1);
    assert_eq!(count(EventKind::TaskStopped), 1);
    assert_eq!(count(EventKind::AttemptRetry), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cuts_wait_short() {
    let portal = Arc::new(FakePortal::new(vec![]));
    let mut settings = settings();
    settings.retry.base_delay_ms = 60_000;
    settings.retry.max_delay_ms = 60_000;
    let service = service_with(Arc::clone(&portal), &settings);
    let id = ready_session(&service).await;
    let mut sub = service.subscribe(&id, 0).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    let _ = events_until(&mut sub, EventKind::AttemptRetry).await;
    let started = tokio::time::Instant::now();
    assert_eq!(service.stop_auto_select(&id).unwrap(), StopAck::Requested);
    let _ = events_until(&mut sub, EventKind::TaskStopped).await;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(portal.started(), 1);
}

// ── Teardown ──

#[tokio::test(start_paused = true)]
async fn destroy_cancels_running_task() {
    let portal = Arc::new(FakePortal::new(vec![]).with_delay(Duration::from_millis(200)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;
    let registry = Arc::clone(service.registry());
    let handle = registry.require(&id).unwrap();

    let _ = service.start_auto_select(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.destroy_session(&id).unwrap();

    assert!(service.status(&id).is_err());
    assert_matches!(service.subscribe(&id, 0), Err(RuntimeError::SessionNotFound(_)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let session = handle.lock();
    let task = session.task().unwrap();
    assert_eq!(task.status, TaskStatus::Stopped);
    assert_eq!(task.last_error.as_deref(), Some("cancelled"));
    drop(session);
    assert_eq!(portal.started(), 1);
    assert_eq!(service.running_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn destroy_during_run_once_still_reports_the_submit() {
    let portal = Arc::new(FakePortal::new(vec![SubmitOutcome::Accepted("选课成功".into())])
        .with_delay(Duration::from_millis(500)));
    let service = service_with(Arc::clone(&portal), &settings());
    let id = ready_session(&service).await;

    let once = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.run_once_select(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.destroy_session(&id).unwrap();

    assert_matches!(once.await.unwrap(), Ok(Outcome::Success { attempts: 1, .. }));
    assert_eq!(portal.started(), 1);
    assert_matches!(service.status(&id), Err(RuntimeError::SessionNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn destroy_during_search_stores_nothing() {
    let portal = Arc::new(FakePortal::new(vec![]).with_search_delay(Duration::from_millis(500)));
    let service = service_with(Arc::clone(&portal), &settings());
    let created = service
        .create_session(&Credentials::new("20231234", "correct"))
        .await
        .unwrap();
    let id = created.session_id;
    let handle = service.registry().require(&id).unwrap();

    let search = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.search(&id, "compilers").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.destroy_session(&id).unwrap();

    assert_matches!(search.await.unwrap(), Err(RuntimeError::SessionNotFound(_)));
    let session = handle.lock();
    assert!(session.token().is_none());
    assert!(session.target().is_none());
    assert!(session.pending().is_none());
}

#[tokio::test(start_paused = true)]
async fn reaper_expires_idle_sessions() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let id = ready_session(&service).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let reaper = service.spawn_reaper(cancel.clone());

    tokio::time::sleep(Duration::from_millis(1_900_000)).await;
    assert!(service.status(&id).is_err());
    assert_eq!(service.active_sessions(), 0);

    cancel.cancel();
    reaper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn watched_session_outlives_idle_timeout() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let id = ready_session(&service).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let reaper = service.spawn_reaper(cancel.clone());

    let delivered = Arc::new(AtomicUsize::new(0));
    let pump = {
        let service = Arc::clone(&service);
        let id = id.clone();
        let mut gateway = CountingGateway {
            delivered: Arc::clone(&delivered),
        };
        tokio::spawn(async move { service.forward(&id, 0, &mut gateway).await })
    };

    tokio::time::sleep(Duration::from_millis(1_900_000)).await;
    assert!(service.status(&id).is_ok());
    assert_eq!(delivered.load(Ordering::SeqCst), 3);

    pump.abort();
    let _ = pump.await;
    tokio::time::sleep(Duration::from_millis(1_900_000)).await;
    assert_matches!(service.status(&id), Err(RuntimeError::SessionNotFound(_)));

    cancel.cancel();
    reaper.await.unwrap();
}

#[tokio::test]
async fn forward_ends_when_session_is_destroyed() {
    let service = service_with(Arc::new(FakePortal::new(vec![])), &settings());
    let id = ready_session(&service).await;
    let delivered = Arc::new(AtomicUsize::new(0));
    let mut gateway = CountingGateway {
        delivered: Arc::clone(&delivered),
    };

    let pump = service.forward(&id, 0, &mut gateway);
    let destroy = async {
        tokio::task::yield_now().await;
        service.destroy_session(&id).unwrap();
    };
    let (end, ()) = tokio::join!(pump, destroy);
    assert_eq!(end.unwrap(), ForwardEnd::TopicClosed { last_seq: 4 });
    assert_eq!(delivered.load(Ordering::SeqCst), 4);
    assert_matches!(
        service.forward(&id, 0, &mut gateway).await,
        Err(RuntimeError::SessionNotFound(_))
    );
}
