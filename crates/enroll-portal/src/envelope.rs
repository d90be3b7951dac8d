//! The portal's `{code, success, message|msg, data}` response envelope.

use serde_json::Value;

/// Longest body excerpt carried in a reason string.
pub const MAX_REASON_CHARS: usize = 100;

/// Whether the envelope reports success (`code == 200` or `success == true`).
pub fn is_success(body: &Value) -> bool {
    let code_ok = match &body["code"] {
        Value::Number(n) => n.as_i64() == Some(200),
        Value::String(s) => s == "200",
        _ => false,
    };
    code_ok || body["success"].as_bool() == Some(true)
}

/// Portal message, from `message` then `msg`.
pub fn message(body: &Value) -> Option<&str> {
    body["message"]
        .as_str()
        .or_else(|| body["msg"].as_str())
        .filter(|m| !m.is_empty())
}

/// Reason phrase for the statuses the portal is known to return.
pub fn status_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unexpected Status",
    }
}

/// Whether a status is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// First [`MAX_REASON_CHARS`] characters of `text`.
pub fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_REASON_CHARS {
        return trimmed.to_owned();
    }
    let head: String = trimmed.chars().take(MAX_REASON_CHARS).collect();
    format!("{head}...")
}

/// `HTTP <status> <phrase>: <body excerpt>`.
pub fn status_reason(status: u16, body: &str) -> String {
    let excerpt = truncate(body);
    if excerpt.is_empty() {
        format!("HTTP {status} {}", status_phrase(status))
    } else {
        format!("HTTP {status} {}: {excerpt}", status_phrase(status))
    }
}
