//! Session resolution and the session-error taxonomy
//!
//! A session is an HS256-signed JWT carried in a cookie. [`CookieStore`]
//! locates and verifies it; every failure is reported as a [`SessionError`]
//! and [`classify`] decides whether the caller should be sent back through
//! sign-in or denied outright.

mod cookie;
mod signer;

pub use cookie::{CookieOptions, CookieStore, CHUNK_SIZE, MAX_CHUNKS};
pub use signer::{Audience, SessionClaims, Signer, DEFAULT_LEEWAY_SECS};

use thiserror::Error;

/// Why a session could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Token `exp` is in the past
    #[error("session: validation failed, token is expired (exp)")]
    Expired,

    /// Token `iat` is in the future
    #[error("session: validation failed, token issued in the future (iat)")]
    IssuedInFuture,

    /// Token could not be decoded or its signature did not verify
    #[error("session: session is malformed")]
    Malformed,

    /// No session cookie on the request
    #[error("session: session is not found")]
    NoSessionFound,

    /// Token `nbf` is in the future
    #[error("session: validation failed, token not valid yet (nbf)")]
    NotValidYet,

    /// Anything else, including verifier construction failures
    #[error("{0}")]
    Other(String),
}

impl SessionError {
    /// Create an unclassified session error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether signing in again can fix this error
    pub fn is_recoverable(&self) -> bool {
        classify(Some(self)) == SessionStatus::Recoverable
    }
}

/// Outcome of session resolution as seen by the decision mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// A session was resolved and verified
    Valid,
    /// The session is missing or stale; re-authentication can fix it
    Recoverable,
    /// The session cannot be fixed by signing in again
    Unrecoverable,
}

/// Classify the result of session resolution.
///
/// New [`SessionError`] variants fail to compile here until they are triaged.
pub fn classify(err: Option<&SessionError>) -> SessionStatus {
    match err {
        None => SessionStatus::Valid,
        Some(
            SessionError::Expired
            | SessionError::IssuedInFuture
            | SessionError::Malformed
            | SessionError::NoSessionFound
            | SessionError::NotValidYet,
        ) => SessionStatus::Recoverable,
        Some(SessionError::Other(_)) => SessionStatus::Unrecoverable,
    }
}
