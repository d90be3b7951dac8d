//! Capability token extraction.
//!
//! A [`TokenExtractor`] owns an ordered list of [`ExtractionStrategy`]
//! implementations. Strategies run one at a time in priority order, each
//! under its own timeout, and the first value that passes the validity
//! predicate wins. Every failure is recorded as a [`StrategyCause`] so the
//! caller can see why the chain came up empty.

pub mod active;
pub mod passive;
pub mod state_scan;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enroll_core::errors::PortalError;
use enroll_core::portal::{AuthContext, PortalClient};
use enroll_core::token::{CapabilityToken, is_plausible_token};
use enroll_settings::ExtractionSettings;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{CauseKind, ExtractionError, StrategyCause};

pub use active::ActiveRequest;
pub use passive::PassiveCapture;
pub use state_scan::StateScan;

/// Expected cost of a strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyClass {
    /// Pure computation over data already in hand.
    Instant,
    /// One portal round-trip.
    Network,
    /// A full page fetch and parse.
    Render,
}

impl LatencyClass {
    /// Budget used when a strategy does not override its timeout.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Instant => Duration::from_millis(100),
            Self::Network => Duration::from_secs(5),
            Self::Render => Duration::from_secs(8),
        }
    }
}

/// Everything a strategy may read. Strategies never mutate session state.
#[derive(Clone, Debug)]
pub struct ExtractionContext {
    /// Session sign-on.
    pub auth: AuthContext,
    /// Keyword of the last search, if any.
    pub keyword: Option<String>,
    /// Raw response bodies captured from the last search.
    pub captured: Vec<String>,
    /// Minimum token length for the validity predicate.
    pub min_token_len: usize,
}

/// One way of obtaining a capability token.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Stable name, used in causes and metrics.
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn priority(&self) -> u8;

    /// Expected cost.
    fn latency(&self) -> LatencyClass;

    /// Time budget for one invocation.
    fn timeout(&self) -> Duration {
        self.latency().default_timeout()
    }

    /// Whether invoking the strategy has no side effects on the portal.
    fn idempotent(&self) -> bool {
        true
    }

    /// Produce a raw candidate, `None` when nothing was found.
    async fn extract(&self, ctx: &ExtractionContext) -> Result<Option<String>, PortalError>;
}

/// First candidate that passes the predicate, else the first candidate of
/// any shape so the caller can report it as invalid.
pub(crate) fn pick_candidate<I>(candidates: I, min_len: usize) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut fallback = None;
    for candidate in candidates {
        if is_plausible_token(&candidate, min_len) {
            return Some(candidate);
        }
        if fallback.is_none() {
            fallback = Some(candidate);
        }
    }
    fallback
}

/// Runs strategies in priority order under per-strategy and aggregate
/// budgets.
pub struct TokenExtractor {
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
    aggregate_timeout: Duration,
}

impl TokenExtractor {
    /// Build an extractor. Strategies are stably sorted by priority.
    pub fn new(mut strategies: Vec<Arc<dyn ExtractionStrategy>>, aggregate_timeout: Duration) -> Self {
        strategies.sort_by_key(|s| s.priority());
        Self {
            strategies,
            aggregate_timeout,
        }
    }

    /// The standard chain: passive capture, active request, state scan.
    pub fn with_defaults(portal: Arc<dyn PortalClient>, settings: &ExtractionSettings) -> Self {
        let strategies: Vec<Arc<dyn ExtractionStrategy>> = vec![
            Arc::new(PassiveCapture::new(Duration::from_millis(
                settings.passive_timeout_ms,
            ))),
            Arc::new(ActiveRequest::new(
                Arc::clone(&portal),
                Duration::from_millis(settings.active_timeout_ms),
            )),
            Arc::new(StateScan::new(
                portal,
                Duration::from_millis(settings.state_scan_timeout_ms),
            )),
        ];
        Self::new(
            strategies,
            Duration::from_millis(settings.aggregate_timeout_ms),
        )
    }

    /// Strategy names in execution order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain until a strategy yields a valid token.
    pub async fn extract(
        &self,
        ctx: &ExtractionContext,
    ) -> Result<CapabilityToken, ExtractionError> {
        let deadline = Instant::now() + self.aggregate_timeout;
        let mut causes = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let name = strategy.name();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.deadline_exceeded(causes));
            }
            let budget = strategy.timeout().min(remaining);

            let cause = match tokio::time::timeout(budget, strategy.extract(ctx)).await {
                Ok(Ok(Some(raw))) => {
                    if let Some(token) = CapabilityToken::parse(&raw, name, ctx.min_token_len) {
                        counter!("token_extractions_total", "strategy" => name, "outcome" => "ok")
                            .increment(1);
                        debug!(strategy = name, token = %token.preview(), "token extracted");
                        return Ok(token);
                    }
                    CauseKind::Invalid {
                        length: raw.trim().chars().count(),
                    }
                }
                Ok(Ok(None)) => CauseKind::Absent,
                Ok(Err(e)) => CauseKind::Failed {
                    message: e.to_string(),
                },
                Err(_) => {
                    // Out of aggregate budget rather than the strategy's own.
                    if budget < strategy.timeout() {
                        causes.push(StrategyCause {
                            strategy: name.to_owned(),
                            cause: CauseKind::TimedOut {
                                timeout_ms: budget.as_millis() as u64,
                            },
                        });
                        counter!("token_extractions_total", "strategy" => name, "outcome" => "timed_out")
                            .increment(1);
                        return Err(self.deadline_exceeded(causes));
                    }
                    CauseKind::TimedOut {
                        timeout_ms: budget.as_millis() as u64,
                    }
                }
            };

            counter!("token_extractions_total", "strategy" => name, "outcome" => cause.label())
                .increment(1);
            debug!(strategy = name, cause = cause.label(), "strategy produced no token");
            causes.push(StrategyCause {
                strategy: name.to_owned(),
                cause,
            });
        }

        warn!(strategies = causes.len(), "token extraction exhausted");
        Err(ExtractionError::Exhausted { causes })
    }

    fn deadline_exceeded(&self, causes: Vec<StrategyCause>) -> ExtractionError {
        warn!(budget_ms = self.aggregate_timeout.as_millis() as u64, "token extraction deadline exceeded");
        ExtractionError::DeadlineExceeded {
            budget_ms: self.aggregate_timeout.as_millis() as u64,
            causes,
        }
    }
}
