//! # enroll-server
//!
//! Axum HTTP control surface and `WebSocket` event push.
//!
//! - JSON routes under `/api/sessions` wrap [`enroll_runtime::EnrollService`]
//!   and answer with a `{success, message, data}` envelope
//! - `GET /ws/{id}?after=N` streams a session's events, replaying from the
//!   ring when the observer reconnects
//! - `/health` and `/metrics` (Prometheus text)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, EnrollServer};
