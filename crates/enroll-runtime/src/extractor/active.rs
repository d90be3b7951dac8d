//! Active request: re-issue the list query the portal itself uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enroll_core::errors::PortalError;
use enroll_core::portal::PortalClient;

use super::{ExtractionContext, ExtractionStrategy, LatencyClass, pick_candidate};

/// Fetches a fresh `secretVal` with one list request.
pub struct ActiveRequest {
    portal: Arc<dyn PortalClient>,
    timeout: Duration,
}

impl ActiveRequest {
    /// Create the strategy over a portal client.
    pub fn new(portal: Arc<dyn PortalClient>, timeout: Duration) -> Self {
        Self { portal, timeout }
    }
}

#[async_trait]
impl ExtractionStrategy for ActiveRequest {
    fn name(&self) -> &'static str {
        "active_request"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn latency(&self) -> LatencyClass {
        LatencyClass::Network
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn extract(&self, ctx: &ExtractionContext) -> Result<Option<String>, PortalError> {
        let keyword = ctx.keyword.as_deref().unwrap_or_default();
        let result = self.portal.search(&ctx.auth, keyword).await?;
        Ok(pick_candidate(
            result.records.into_iter().filter_map(|r| r.secret_val),
            ctx.min_token_len,
        ))
    }
}
