//! Failure classification and backoff, driven by settings.

use std::time::Duration;

use enroll_core::course::SubmitOutcome;
use enroll_core::retry::{FailureClass, calculate_backoff_delay};
use enroll_settings::{ClassificationRules, RetrySettings};

/// Retry behavior for one auto-select loop.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts allowed per task.
    pub max_attempts: u32,
    /// Per-attempt time budget.
    pub attempt_timeout: Duration,
    base_delay_ms: u64,
    backoff_factor: f64,
    max_delay_ms: u64,
    jitter_factor: f64,
    rules: ClassificationRules,
}

impl RetryPolicy {
    /// Build from the retry settings section.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(settings.attempt_timeout_ms),
            base_delay_ms: settings.base_delay_ms,
            backoff_factor: settings.backoff_factor,
            max_delay_ms: settings.max_delay_ms,
            jitter_factor: settings.jitter_factor,
            rules: settings.classification.clone(),
        }
    }

    /// Class of a submit outcome, `None` when it was accepted.
    pub fn classify(&self, outcome: &SubmitOutcome) -> Option<FailureClass> {
        match outcome {
            SubmitOutcome::Accepted(_) => None,
            SubmitOutcome::Transient(_) => Some(FailureClass::Retryable),
            SubmitOutcome::Rejected(reason) => Some(self.classify_reason(reason)),
        }
    }

    /// Class of a rejection reason. Fatal patterns win over stale-token
    /// patterns, which win over retryable ones.
    pub fn classify_reason(&self, reason: &str) -> FailureClass {
        let matches = |patterns: &[String]| patterns.iter().any(|p| reason.contains(p.as_str()));
        if matches(&self.rules.fatal) {
            FailureClass::Fatal
        } else if matches(&self.rules.stale_token) {
            FailureClass::StaleToken
        } else if matches(&self.rules.retryable) {
            FailureClass::Retryable
        } else {
            self.rules.unmatched
        }
    }

    /// Wait before retry number `retry_index` (zero-based).
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            retry_index,
            self.base_delay_ms,
            self.backoff_factor,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings::default())
    }

    // ── Classification ──

    #[test]
    fn course_full_is_retryable() {
        let p = policy();
        assert_eq!(
            p.classify(&SubmitOutcome::Rejected("课容量已满".into())),
            Some(FailureClass::Retryable)
        );
        assert_eq!(
            p.classify_reason("该课程已在选课结果中"),
            FailureClass::Retryable
        );
    }

    #[test]
    fn fatal_patterns_win() {
        let p = policy();
        assert_eq!(p.classify_reason("时间冲突"), FailureClass::Fatal);
        assert_eq!(p.classify_reason("参数错误: secretVal"), FailureClass::Fatal);
    }

    #[test]
    fn stale_token_patterns() {
        assert_eq!(policy().classify_reason("secretVal 已失效"), FailureClass::StaleToken);
        assert_eq!(policy().classify_reason("非法请求"), FailureClass::StaleToken);
    }

    #[test]
    fn unmatched_uses_default_class() {
        assert_eq!(policy().classify_reason("something new"), FailureClass::Fatal);

        let mut settings = RetrySettings::default();
        settings.classification.unmatched = FailureClass::Retryable;
        let p = RetryPolicy::from_settings(&settings);
        assert_eq!(p.classify_reason("something new"), FailureClass::Retryable);
    }

    #[test]
    fn transient_always_retryable_and_accepted_unclassified() {
        let p = policy();
        assert_eq!(
            p.classify(&SubmitOutcome::Transient("权限不足".into())),
            Some(FailureClass::Retryable)
        );
        assert_eq!(p.classify(&SubmitOutcome::Accepted("ok".into())), None);
    }

    // ── Backoff ──

    #[test]
    fn default_delay_near_one_second() {
        let p = policy();
        for i in 0..10 {
            let d = p.delay_for(i).as_millis();
            assert!((900..=1100).contains(&d), "{d}");
        }
    }
}
