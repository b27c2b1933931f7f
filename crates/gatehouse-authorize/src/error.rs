//! Error types for the authorize service

use std::time::Duration;

use thiserror::Error;

/// Authorize service error types
///
/// Session verification failures are not errors at this level; they are
/// carried as [`crate::SessionError`] and mapped into a response.
#[derive(Debug, Error)]
pub enum Error {
    /// Policy evaluator failed to produce a decision
    #[error("policy evaluation error: {message}")]
    Evaluation {
        /// Error message
        message: String,
    },

    /// Policy evaluator did not answer before the deadline
    #[error("policy evaluation exceeded deadline of {}ms", timeout.as_millis())]
    DeadlineExceeded {
        /// Configured evaluation deadline
        timeout: Duration,
    },

    /// Policy text could not be parsed or loaded
    #[error("policy error: {message}")]
    Policy {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// gRPC transport error
    #[error("gRPC error: {message}")]
    Grpc {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Create a policy evaluation error
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation {
            message: msg.into(),
        }
    }

    /// Create a deadline exceeded error
    pub fn deadline_exceeded(timeout: Duration) -> Self {
        Self::DeadlineExceeded { timeout }
    }

    /// Create a policy error
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a gRPC error
    pub fn grpc(msg: impl Into<String>) -> Self {
        Self::Grpc {
            message: msg.into(),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match &e {
            Error::DeadlineExceeded { .. } => tonic::Status::deadline_exceeded(e.to_string()),
            Error::Configuration { .. } => tonic::Status::failed_precondition(e.to_string()),
            Error::Evaluation { .. } | Error::Policy { .. } | Error::Grpc { .. } => {
                tonic::Status::internal(e.to_string())
            }
        }
    }
}

/// Result type for authorize operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_error() {
        let err = Error::evaluation("backend unavailable");
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[test]
    fn test_deadline_message_includes_timeout() {
        let err = Error::deadline_exceeded(Duration::from_millis(250));
        assert_eq!(
            err.to_string(),
            "policy evaluation exceeded deadline of 250ms"
        );
    }

    #[test]
    fn test_status_code_mapping() {
        let status: tonic::Status = Error::deadline_exceeded(Duration::from_secs(1)).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = Error::evaluation("boom").into();
        assert_eq!(status.code(), tonic::Code::Internal);

        let status: tonic::Status = Error::configuration("no secret").into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
