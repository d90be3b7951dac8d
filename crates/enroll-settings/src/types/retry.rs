//! Auto-select retry policy and failure classification rules.
//!
//! The portal reports refusals as free text. Which texts are worth retrying
//! is kept here as reviewable data instead of being buried in the loop.

use enroll_core::retry::FailureClass;
use serde::{Deserialize, Serialize};

/// Retry policy for the auto-select loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Hard cap on submit attempts per task, retryable or not.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per retry (`1.0` for a fixed interval).
    pub backoff_factor: f64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Symmetric jitter range (0.0–1.0).
    pub jitter_factor: f64,
    /// Bound on a single submit attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Failure classification rules.
    pub classification: ClassificationRules,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            base_delay_ms: 1_000,
            backoff_factor: 1.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            attempt_timeout_ms: 15_000,
            classification: ClassificationRules::default(),
        }
    }
}

/// Substring rules mapping portal refusal messages to a [`FailureClass`].
///
/// Rules are checked fatal first, then stale token, then retryable; a
/// message matching none of them gets `unmatched`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassificationRules {
    /// Messages that end the task.
    pub fatal: Vec<String>,
    /// Messages meaning the capability token was refused.
    pub stale_token: Vec<String>,
    /// Messages worth waiting out.
    pub retryable: Vec<String>,
    /// Class for messages no rule matches.
    pub unmatched: FailureClass,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            fatal: strings(&[
                "认证失败",
                "用户名或密码错误",
                "账户被锁定",
                "权限不足",
                "访问被拒绝",
                "参数错误",
                "配置错误",
                "课程ID无效",
                "时间冲突",
                "不在选课时间",
            ]),
            stale_token: strings(&["secretVal", "参数已过期", "非法请求"]),
            retryable: strings(&[
                "课容量已满",
                "该课程已在选课结果中",
                "请求过于频繁",
                "系统繁忙",
            ]),
            unmatched: FailureClass::Fatal,
        }
    }
}
