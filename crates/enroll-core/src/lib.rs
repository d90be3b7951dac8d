//! # enroll-core
//!
//! Foundation types, errors, branded IDs, and collaborator traits for the
//! enroll service.
//!
//! This crate provides the shared vocabulary that all other enroll crates depend on:
//!
//! - **Branded IDs**: [`ids::SessionId`], [`ids::TaskId`] as newtypes
//! - **Tokens**: [`token::CapabilityToken`] and its validity predicate
//! - **Courses**: [`course::CourseRecord`], [`course::SearchResult`], [`course::SubmitOutcome`]
//! - **Events**: [`events::Event`] with per-session sequence numbers
//! - **Errors**: [`errors::AuthError`] and [`errors::PortalError`] via `thiserror`
//! - **Collaborators**: [`portal::AuthProvider`] and [`portal::PortalClient`]
//! - **Retry**: backoff calculation and [`retry::FailureClass`]
//! - **Logging**: [`logging::init_subscriber`]
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other enroll crates.

#![deny(unsafe_code)]

pub mod course;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod portal;
pub mod retry;
pub mod token;
