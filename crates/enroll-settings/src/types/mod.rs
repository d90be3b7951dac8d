//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it overrides.

mod portal;
mod retry;
mod server;

pub use portal::*;
pub use retry::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "retry": { "maxAttempts": 200, "baseDelayMs": 500 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrollSettings {
    /// HTTP/WebSocket server.
    pub server: ServerSettings,
    /// Course portal endpoints and HTTP behavior.
    pub portal: PortalSettings,
    /// Auto-select retry policy.
    pub retry: RetrySettings,
    /// Capability token extraction.
    pub extraction: ExtractionSettings,
    /// Session lifecycle.
    pub session: SessionSettings,
    /// Event bus sizing.
    pub events: EventSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl EnrollSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 9] = [
            (self.retry.max_attempts > 0, "retry.maxAttempts must be greater than 0"),
            (
                self.retry.base_delay_ms <= self.retry.max_delay_ms,
                "retry.baseDelayMs must not exceed retry.maxDelayMs",
            ),
            (
                (0.0..=1.0).contains(&self.retry.jitter_factor),
                "retry.jitterFactor must be within 0.0..=1.0",
            ),
            (
                self.retry.backoff_factor >= 1.0,
                "retry.backoffFactor must be at least 1.0",
            ),
            (self.retry.attempt_timeout_ms > 0, "retry.attemptTimeoutMs must be greater than 0"),
            (
                self.extraction.min_token_length > 0,
                "extraction.minTokenLength must be greater than 0",
            ),
            (self.events.ring_capacity > 0, "events.ringCapacity must be greater than 0"),
            (
                self.events.observer_queue_capacity > 0,
                "events.observerQueueCapacity must be greater than 0",
            ),
            (
                self.session.sweep_interval_ms > 0,
                "session.sweepIntervalMs must be greater than 0",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(SettingsError::InvalidValue((*message).to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: EnrollSettings =
            serde_json::from_str(r#"{"retry": {"maxAttempts": 7}}"#).unwrap();
        assert_eq!(settings.retry.max_attempts, 7);
        assert_eq!(settings.retry.base_delay_ms, 1000);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut settings = EnrollSettings::default();
        settings.retry.max_attempts = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("maxAttempts"));
    }

    #[test]
    fn inverted_delays_rejected() {
        let mut settings = EnrollSettings::default();
        settings.retry.base_delay_ms = 60_000;
        settings.retry.max_delay_ms = 1_000;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut settings = EnrollSettings::default();
        settings.retry.jitter_factor = 1.5;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("jitter"));
    }

    #[test]
    fn zero_ring_rejected() {
        let mut settings = EnrollSettings::default();
        settings.events.ring_capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(EnrollSettings::default()).unwrap();
        assert!(json["retry"].get("maxAttempts").is_some());
        assert!(json["events"].get("ringCapacity").is_some());
        assert!(json["session"].get("idleTimeoutMs").is_some());
    }
}
