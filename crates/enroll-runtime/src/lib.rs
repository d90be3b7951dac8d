//! # enroll-runtime
//!
//! Token acquisition and retry orchestration for course election sessions.
//!
//! - **Extractor**: [`extractor::TokenExtractor`] runs an ordered chain of
//!   [`extractor::ExtractionStrategy`] implementations until one yields a
//!   valid capability token
//! - **Registry**: [`registry::SessionRegistry`] owns every live session and
//!   its state machine
//! - **Orchestrator**: [`orchestrator::Orchestrator`] runs one-shot submits
//!   and the single-flight auto-retry loop
//! - **Event bus**: [`bus::EventBus`] sequences session events and fans them
//!   out to observers
//! - **Gateway**: [`gateway::forward`] pumps a subscription into a
//!   [`gateway::TransportGateway`]
//! - **Service**: [`service::EnrollService`] is the control surface the
//!   server calls
//!
//! ## Crate Position
//!
//! Depends on `enroll-core` and `enroll-settings`. Depended on by
//! `enroll-server` and `enroll-agent`.

#![deny(unsafe_code)]

pub mod bus;
pub mod errors;
pub mod extractor;
pub mod gateway;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod service;
pub mod task;

pub use errors::{ExtractionError, RuntimeError};
pub use service::EnrollService;
