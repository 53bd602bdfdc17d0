//! Credential bootstrap errors.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while preparing the SSH credential. Every variant is
/// cloneable so a single failure can be replayed to all callers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when the key location cannot be determined.
    #[error("cannot resolve key location: {0}")]
    Location(String),
    /// Raised when the key directory or files cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the key generator fails.
    #[error("key generation failed: {0}")]
    Generation(String),
    /// Raised when both the API and the CLI fallback refuse the key.
    #[error("key registration failed (api: {api}; cli: {cli})")]
    Registration {
        /// Error returned by the provider API.
        api: String,
        /// Error returned by the CLI fallback.
        cli: String,
    },
}
