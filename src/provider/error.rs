//! Error types shared by provider implementations.

use thiserror::Error;

/// Errors raised by the provider control plane.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Transport-level failure (connection refused, timeout, TLS). These are
    /// potentially transient.
    #[error("provider unavailable during {operation}: {message}")]
    Unavailable {
        /// Operation being performed (for example `search_offers`).
        operation: String,
        /// Transport error message.
        message: String,
    },
    /// The provider answered but rejected the request, or answered with a
    /// payload that does not match the expected contract.
    #[error("provider rejected {operation}: {message}")]
    Rejected {
        /// Operation being performed.
        operation: String,
        /// HTTP status when the rejection came from a non-2xx response.
        status: Option<u16>,
        /// Provider error message or decode failure, kept for diagnostics.
        message: String,
    },
}

impl ProviderError {
    /// Builds an [`ProviderError::Unavailable`] error.
    #[must_use]
    pub fn unavailable(operation: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }

    /// Builds a [`ProviderError::Rejected`] error for a malformed payload.
    #[must_use]
    pub fn malformed(operation: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.to_owned(),
            status: None,
            message: message.into(),
        }
    }

    /// Returns `true` for transport failures that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
