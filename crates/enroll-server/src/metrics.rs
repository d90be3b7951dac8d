//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup before any metric is recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// A handle backed by a private recorder, for tests and embedding.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric names recorded across crates.

/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Running auto-select tasks (gauge).
pub const AUTO_TASKS_ACTIVE: &str = "auto_tasks_active";
/// Submit attempts (counter, labels: class).
pub const SELECT_ATTEMPTS_TOTAL: &str = "select_attempts_total";
/// Token extraction runs per strategy (counter, labels: strategy, outcome).
pub const TOKEN_EXTRACTIONS_TOTAL: &str = "token_extractions_total";
/// Events dropped from full observer queues (counter).
pub const EVENT_OBSERVER_DROPS_TOTAL: &str = "event_observer_drops_total";
/// Portal submits (counter, labels: outcome).
pub const PORTAL_SUBMITS_TOTAL: &str = "portal_submits_total";
/// Sign-on attempts (counter, labels: outcome).
pub const AUTH_ATTEMPTS_TOTAL: &str = "auth_attempts_total";
/// `WebSocket` observers opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open `WebSocket` observers (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// `WebSocket` upgrades refused at the connection limit (counter).
pub const WS_CONNECTIONS_REFUSED_TOTAL: &str = "ws_connections_refused_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let handle = detached_handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            SESSIONS_ACTIVE,
            AUTO_TASKS_ACTIVE,
            SELECT_ATTEMPTS_TOTAL,
            TOKEN_EXTRACTIONS_TOTAL,
            EVENT_OBSERVER_DROPS_TOTAL,
            PORTAL_SUBMITS_TOTAL,
            AUTH_ATTEMPTS_TOTAL,
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REFUSED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
