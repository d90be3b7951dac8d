//! `WebSocket` event push.

pub mod connection;
pub mod gateway;
pub mod session;
