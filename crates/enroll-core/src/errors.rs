//! Errors raised by external collaborators.

use thiserror::Error;

/// Sign-on failure. No session is created when authentication fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The identity provider refused the credentials or the flow broke off.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    /// The identity provider could not be reached.
    #[error("authentication service unavailable: {0}")]
    Unavailable(String),
}

/// Failure talking to the course portal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortalError {
    /// Network-level failure (connect, timeout, TLS).
    #[error("portal request failed: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("portal returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Status phrase or truncated body.
        message: String,
    },
    /// The portal answered with an application-level error.
    #[error("portal refused request: {0}")]
    Refused(String),
    /// The response body could not be parsed.
    #[error("malformed portal response: {0}")]
    Malformed(String),
}

impl PortalError {
    /// Whether repeating the same request might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Refused(_) | Self::Malformed(_) => false,
        }
    }
}
