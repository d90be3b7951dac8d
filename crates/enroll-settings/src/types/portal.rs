//! Portal client and token extraction settings.

use serde::{Deserialize, Serialize};

/// Course portal endpoints and HTTP client behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalSettings {
    /// Portal origin, without trailing slash.
    pub base_url: String,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Teaching class type used for search and submit.
    pub class_type: String,
    /// Campus code used for search.
    pub campus: String,
    /// Page size used for search.
    pub page_size: u32,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            base_url: "https://byxk.buaa.edu.cn".to_string(),
            request_timeout_ms: 10_000,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36"
                .to_string(),
            class_type: "FANKC".to_string(),
            campus: "1".to_string(),
            page_size: 10,
        }
    }
}

/// Capability token extraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionSettings {
    /// Minimum token length accepted by the validity predicate.
    pub min_token_length: usize,
    /// Budget for the whole strategy chain, in milliseconds.
    pub aggregate_timeout_ms: u64,
    /// Timeout for the passive capture strategy, in milliseconds.
    pub passive_timeout_ms: u64,
    /// Timeout for the active request strategy, in milliseconds.
    pub active_timeout_ms: u64,
    /// Timeout for the state scan strategy, in milliseconds.
    pub state_scan_timeout_ms: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            min_token_length: 32,
            aggregate_timeout_ms: 15_000,
            passive_timeout_ms: 100,
            active_timeout_ms: 5_000,
            state_scan_timeout_ms: 8_000,
        }
    }
}
