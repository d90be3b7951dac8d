//! Server, session, event and logging settings.
//!
//! Grouped here because they are small and server-oriented.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent WebSocket observers.
    pub max_connections: usize,
    /// Interval between server Ping frames, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Disconnect an observer after this long without a Pong, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Serve `POST /api/shutdown`.
    pub allow_remote_shutdown: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 100,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            allow_remote_shutdown: false,
        }
    }
}

/// Session lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Destroy a session after this long without activity, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Keep a finished task visible for this long, in milliseconds.
    pub task_grace_ms: u64,
    /// How often the reaper sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 1_800_000,
            task_grace_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Event bus sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Events retained per session for replay.
    pub ring_capacity: usize,
    /// Per-observer queue length before the oldest event is dropped.
    pub observer_queue_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            ring_capacity: 500,
            observer_queue_capacity: 256,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
