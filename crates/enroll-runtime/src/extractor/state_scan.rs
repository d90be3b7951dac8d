//! State scan: look for the token in the landing page's own markup.
//!
//! Heuristics, in order:
//! 1. script globals such as `window.secretVal = "..."`
//! 2. a hidden `input[name="secretVal"]`
//! 3. any free-text `secretVal: "..."` assignment
//!
//! A heuristic's value only counts if it meets the minimum length.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use enroll_core::errors::PortalError;
use enroll_core::portal::PortalClient;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::trace;

use super::{ExtractionContext, ExtractionStrategy, LatencyClass};

static GLOBAL_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:window\.|var\s+|let\s+|const\s+)(?:secretVal|secret_val|__SECRET_VAL__)\s*=\s*["']([^"']+)["']"#,
    )
    .unwrap()
});

static FREE_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"secretVal["']?\s*[:=]\s*["']([^"']*)["']"#).unwrap());

static HIDDEN_FIELD: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="secretVal"]"#).unwrap());

/// Scans the grab-lessons landing page.
pub struct StateScan {
    portal: Arc<dyn PortalClient>,
    timeout: Duration,
}

impl StateScan {
    /// Create the strategy over a portal client.
    pub fn new(portal: Arc<dyn PortalClient>, timeout: Duration) -> Self {
        Self { portal, timeout }
    }
}

fn long_enough(value: &str, min_len: usize) -> bool {
    value.trim().chars().count() >= min_len
}

/// Apply the heuristics to a page. `Html` is not `Send`, so this stays sync.
pub(crate) fn scan_html(html: &str, min_len: usize) -> Option<String> {
    if let Some(found) = GLOBAL_ASSIGNMENT
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|v| long_enough(v, min_len))
    {
        trace!("token found in script global");
        return Some(found.to_owned());
    }

    let document = Html::parse_document(html);
    if let Some(found) = document
        .select(&HIDDEN_FIELD)
        .filter_map(|el| el.value().attr("value"))
        .find(|v| long_enough(v, min_len))
    {
        trace!("token found in hidden field");
        return Some(found.to_owned());
    }

    FREE_TEXT
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|v| long_enough(v, min_len))
        .map(str::to_owned)
}

#[async_trait]
impl ExtractionStrategy for StateScan {
    fn name(&self) -> &'static str {
        "state_scan"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn latency(&self) -> LatencyClass {
        LatencyClass::Render
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn extract(&self, ctx: &ExtractionContext) -> Result<Option<String>, PortalError> {
        let html = self.portal.landing_page(&ctx.auth).await?;
        Ok(scan_html(&html, ctx.min_token_len))
    }
}
