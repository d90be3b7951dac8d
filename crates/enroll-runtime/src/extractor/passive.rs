//! Passive capture: scan response bodies already captured from the search.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use enroll_core::errors::PortalError;
use regex::Regex;

use super::{ExtractionContext, ExtractionStrategy, LatencyClass, pick_candidate};

static SECRET_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""secretVal"[:\s]*"([^"]+)""#).unwrap());

/// Reads `secretVal` out of the list response captured during search.
pub struct PassiveCapture {
    timeout: Duration,
}

impl PassiveCapture {
    /// Create the strategy with its time budget.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Every `secretVal` value in a body, in document order.
pub(crate) fn scan_body(body: &str) -> impl Iterator<Item = String> + '_ {
    SECRET_FIELD
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_owned()))
}

#[async_trait]
impl ExtractionStrategy for PassiveCapture {
    fn name(&self) -> &'static str {
        "passive_capture"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn latency(&self) -> LatencyClass {
        LatencyClass::Instant
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn extract(&self, ctx: &ExtractionContext) -> Result<Option<String>, PortalError> {
        // Newest capture first.
        let candidates = ctx
            .captured
            .iter()
            .rev()
            .flat_map(|body| scan_body(body))
            .collect::<Vec<_>>();
        Ok(pick_candidate(candidates, ctx.min_token_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use enroll_core::portal::AuthContext;

    fn ctx(captured: Vec<String>) -> ExtractionContext {
        ExtractionContext {
            auth: AuthContext {
                principal: "u".into(),
                bearer: "b".into(),
                batch_id: "B".into(),
                issued_at: Utc::now(),
            },
            keyword: None,
            captured,
            min_token_len: 32,
        }
    }

    #[tokio::test]
    async fn finds_secret_in_list_body() {
        let token = "a1".repeat(24);
        let body = format!(
            r#"{{"code":200,"data":{{"rows":[{{"JXBID":"1","secretVal": "{token}"}}]}}}}"#
        );
        let found = PassiveCapture::new(Duration::from_millis(100))
            .extract(&ctx(vec![body]))
            .await
            .unwrap();
        assert_eq!(found.unwrap(), token);
    }

    #[tokio::test]
    async fn newest_capture_wins() {
        let old = format!(r#"{{"secretVal":"{}"}}"#, "o".repeat(40));
        let new = format!(r#"{{"secretVal":"{}"}}"#, "n".repeat(40));
        let found = PassiveCapture::new(Duration::from_millis(100))
            .extract(&ctx(vec![old, new]))
            .await
            .unwrap();
        assert_eq!(found.unwrap(), "n".repeat(40));
    }

    #[tokio::test]
    async fn nothing_captured_is_absent() {
        let found = PassiveCapture::new(Duration::from_millis(100))
            .extract(&ctx(vec![r#"{"code":200,"data":{"rows":[]}}"#.into()]))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
