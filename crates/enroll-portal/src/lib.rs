//! # enroll-portal
//!
//! HTTP implementations of the collaborator traits in `enroll-core`:
//!
//! - [`PortalHttpClient`]: course search, submit and landing page over the
//!   portal's JSON/form endpoints
//! - [`CasAuthenticator`]: CAS username/password sign-on that yields the
//!   portal bearer token and the active elective batch
//!
//! ## Crate Position
//!
//! Depends on `enroll-core` and `enroll-settings`. Used by `enroll-agent`
//! to wire the service.

#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod envelope;

pub use auth::CasAuthenticator;
pub use client::PortalHttpClient;
