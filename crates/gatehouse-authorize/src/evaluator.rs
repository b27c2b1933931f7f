//! Policy evaluator adapter
//!
//! The evaluation algorithm lives behind [`PolicyEvaluator`]; this module only
//! invokes it under a deadline.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::request::CanonicalRequest;

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allow: bool,
    /// Human-readable causes of a denial
    pub deny_reasons: Vec<String>,
}

impl Decision {
    /// An allowing decision
    pub fn allow() -> Self {
        Self {
            allow: true,
            deny_reasons: Vec::new(),
        }
    }

    /// A denying decision with the given reasons
    pub fn deny(reasons: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allow: false,
            deny_reasons: reasons.into_iter().map(Into::into).collect(),
        }
    }
}

/// Decides whether a canonical request may proceed
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate `request`
    async fn is_authorized(&self, request: &CanonicalRequest) -> Result<Decision>;
}

/// Invoke `evaluator`, abandoning the evaluation once `timeout` elapses
pub async fn evaluate(
    evaluator: &dyn PolicyEvaluator,
    request: &CanonicalRequest,
    timeout: Duration,
) -> Result<Decision> {
    match tokio::time::timeout(timeout, evaluator.is_authorized(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                url = %request.url,
                "Policy evaluation exceeded deadline"
            );
            Err(Error::deadline_exceeded(timeout))
        }
    }
}
