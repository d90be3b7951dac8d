//! Retry classification and backoff calculation.
//!
//! This module holds the portable, sync-only building blocks. The async
//! retry loop itself lives in `enroll-runtime`:
//!
//! - [`FailureClass`]: how a failed attempt is treated
//! - [`calculate_backoff_delay`]: bounded backoff with jitter

use std::fmt;

use serde::{Deserialize, Serialize};

/// Floor applied to every computed delay, in milliseconds.
pub const MIN_DELAY_MS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// How a failed attempt is handled by the retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Wait and try again.
    Retryable,
    /// The capability token was refused; refresh it once, then retry.
    StaleToken,
    /// Stop the task.
    Fatal,
}

impl FailureClass {
    /// Metric label for this class.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::StaleToken => "stale_token",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate the delay before retry number `attempt` (zero-based).
///
/// Formula: `min(max_delay, base_delay * factor^attempt) * (1 + (random * 2 - 1) * jitter)`,
/// floored at [`MIN_DELAY_MS`]. A `factor` of `1.0` gives a fixed interval.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG; `0.5` yields the
/// un-jittered value.
#[must_use]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    backoff_factor: f64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponent = attempt.min(31) as i32;
    let exponential = (base_delay_ms as f64) * backoff_factor.max(1.0).powi(exponent);
    let capped = exponential.min(max_delay_ms as f64);

    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped * jitter).round().max(0.0) as u64;

    with_jitter.max(MIN_DELAY_MS)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
