//! Collaborator traits for sign-on and the course portal.
//!
//! The runtime only talks to the outside world through these traits. The
//! HTTP implementations live in `enroll-portal`; tests use in-memory fakes.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::course::{SearchResult, SubmitOutcome};
use crate::errors::{AuthError, PortalError};
use crate::token::CapabilityToken;

/// Sign-on credentials.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Account name (student number).
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Build credentials from parts.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated portal context returned by an [`AuthProvider`].
///
/// The runtime treats this as opaque and only hands it back to the
/// [`PortalClient`].
#[derive(Clone)]
pub struct AuthContext {
    /// Identity that signed on.
    pub principal: String,
    /// Bearer sent as the `Authorization` header.
    pub bearer: String,
    /// Active election batch.
    pub batch_id: String,
    /// When sign-on completed.
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("principal", &self.principal)
            .field("batch_id", &self.batch_id)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Interactive sign-on.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate and return an opaque context. Retrying is the caller's
    /// decision.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext, AuthError>;
}

/// Course portal operations.
#[async_trait]
pub trait PortalClient: Send + Sync {
    /// Search the course list by keyword.
    async fn search(&self, auth: &AuthContext, keyword: &str) -> Result<SearchResult, PortalError>;

    /// Submit an add-course request for `course_id`.
    async fn submit(
        &self,
        auth: &AuthContext,
        course_id: &str,
        token: &CapabilityToken,
    ) -> SubmitOutcome;

    /// Fetch the election landing page HTML.
    async fn landing_page(&self, auth: &AuthContext) -> Result<String, PortalError>;
}
