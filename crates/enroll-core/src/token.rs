//! Capability tokens and their validity predicate.
//!
//! The portal's write endpoint requires a short-lived `secretVal` alongside
//! the session bearer. A [`CapabilityToken`] can only be built from a value
//! that passes [`is_plausible_token`], so an invalid value is never stored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default minimum length for a token value.
pub const DEFAULT_MIN_TOKEN_LEN: usize = 32;

/// Characters shown by [`CapabilityToken::preview`].
const PREVIEW_LEN: usize = 8;

/// Check whether a raw value has the shape of a capability token.
///
/// The value must be at least `min_len` characters after trimming and must not
/// contain whitespace or quote characters (a sign that a pattern matched too
/// much of the surrounding text).
pub fn is_plausible_token(value: &str, min_len: usize) -> bool {
    let trimmed = value.trim();
    trimmed.chars().count() >= min_len
        && !trimmed
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'')
}

/// A validated capability token.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityToken {
    #[serde(skip)]
    value: String,
    /// When the token was captured.
    pub captured_at: DateTime<Utc>,
    /// Name of the strategy that produced the token.
    pub source: String,
}

impl CapabilityToken {
    /// Validate `raw` and wrap it. Returns `None` when the value fails the
    /// shape predicate.
    pub fn parse(raw: &str, source: impl Into<String>, min_len: usize) -> Option<Self> {
        is_plausible_token(raw, min_len).then(|| Self {
            value: raw.trim().to_owned(),
            captured_at: Utc::now(),
            source: source.into(),
        })
    }

    /// The full token value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Re-check the token against a threshold.
    pub fn is_valid(&self, min_len: usize) -> bool {
        is_plausible_token(&self.value, min_len)
    }

    /// A short prefix safe to show in logs and API responses.
    pub fn preview(&self) -> String {
        let head: String = self.value.chars().take(PREVIEW_LEN).collect();
        format!("{head}…")
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("value", &self.preview())
            .field("captured_at", &self.captured_at)
            .field("source", &self.source)
            .finish()
    }
}
