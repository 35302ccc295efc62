//! Provider error type shared by all storage backends.
//!
//! Every provider operation returns `Result<_, ProviderError>`. The
//! `retryable` flag drives dispatcher behavior: retryable errors are retried
//! with backoff and eventually abandoned back to the queue, while permanent
//! errors commit a terminal infrastructure failure for the instance.
//!
//! Classification guidance:
//! - retryable: connection loss, timeouts, lock contention, pool exhaustion
//! - permanent: serialization failures, constraint violations, invalid or
//!   expired lock tokens, missing instances

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed, e.g. "fetch_orchestration_item"
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Convert into the unified error taxonomy for recording in history
    /// or surfacing through orchestration status.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
