//! One-time SSH credential bootstrap shared by every provisioning worker.
//!
//! The bootstrapper moves through `Unattempted → InProgress → Resolved`.
//! Exactly one caller runs key generation and registration; concurrent
//! callers wait for it and every caller, present and future, receives the
//! same memoized outcome.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::provider::Provider;
use crate::shell::CommandRunner;

mod error;
mod key_store;

pub use error::CredentialError;
pub use key_store::{DEFAULT_KEY_COMMENT, KeyStore};

/// A local key pair that has been registered with the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credential {
    /// Path to the private key used for SSH authentication.
    pub private_key: camino::Utf8PathBuf,
    /// OpenSSH encoded public key.
    pub public_key: String,
}

/// Observable state of a [`CredentialBootstrapper`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootstrapState {
    /// No caller has requested the credential yet.
    Unattempted,
    /// The single bootstrap execution is running.
    InProgress,
    /// Bootstrap finished; the outcome is frozen for the process lifetime.
    Resolved(Result<Credential, CredentialError>),
}

/// Future returned by [`CredentialProvider::credential`].
pub type CredentialFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Credential, CredentialError>> + Send + 'a>>;

/// Capability for obtaining the process-wide credential.
pub trait CredentialProvider: Send + Sync {
    /// Returns the credential, bootstrapping it on first use.
    fn credential(&self) -> CredentialFuture<'_>;
}

/// Generates and registers the fleet key pair at most once.
pub struct CredentialBootstrapper<P, R> {
    provider: Arc<P>,
    runner: R,
    store: KeyStore,
    cli_bin: String,
    started: AtomicBool,
    outcome: OnceCell<Result<Credential, CredentialError>>,
}

impl<P, R> std::fmt::Debug for CredentialBootstrapper<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBootstrapper")
            .field("store", &self.store)
            .field("cli_bin", &self.cli_bin)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<P, R> CredentialBootstrapper<P, R> {
    /// Returns the key store backing this bootstrapper.
    #[must_use]
    pub const fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Reports where the bootstrapper is in its lifecycle.
    #[must_use]
    pub fn state(&self) -> BootstrapState {
        match self.outcome.get() {
            Some(outcome) => BootstrapState::Resolved(outcome.clone()),
            None if self.started.load(Ordering::SeqCst) => BootstrapState::InProgress,
            None => BootstrapState::Unattempted,
        }
    }
}

impl<P, R> CredentialBootstrapper<P, R>
where
    P: Provider,
    R: CommandRunner,
{
    /// Creates a bootstrapper. `cli_bin` is the marketplace CLI used as the
    /// registration fallback.
    #[must_use]
    pub fn new(provider: Arc<P>, runner: R, store: KeyStore, cli_bin: impl Into<String>) -> Self {
        Self {
            provider,
            runner,
            store,
            cli_bin: cli_bin.into(),
            started: AtomicBool::new(false),
            outcome: OnceCell::new(),
        }
    }

    /// Ensures the credential exists and is registered.
    ///
    /// # Errors
    ///
    /// Returns the memoized [`CredentialError`] when generation or
    /// registration failed on the first attempt.
    pub async fn ensure(&self) -> Result<Credential, CredentialError> {
        self.outcome
            .get_or_init(|| async {
                self.started.store(true, Ordering::SeqCst);
                self.bootstrap().await
            })
            .await
            .clone()
    }

    async fn bootstrap(&self) -> Result<Credential, CredentialError> {
        let credential = self.store.ensure_key_pair(&self.runner).await?;
        self.register(&credential.public_key).await?;
        info!(key = %credential.private_key, "ssh credential registered");
        Ok(credential)
    }

    async fn register(&self, public_key: &str) -> Result<(), CredentialError> {
        let api_error = match self.provider.register_public_key(public_key).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(error = %api_error, cli = %self.cli_bin, "api key registration failed; trying cli");

        let args = [
            OsString::from("create"),
            OsString::from("ssh-key"),
            OsString::from(public_key),
        ];
        let cli_message = match self.runner.run(&self.cli_bin, &args).await {
            Ok(output) if output.is_success() => return Ok(()),
            Ok(output) => format!(
                "{} exited with status {}: {}",
                self.cli_bin,
                output.status_text(),
                output.stderr.trim()
            ),
            Err(err) => err.to_string(),
        };

        Err(CredentialError::Registration {
            api: api_error.to_string(),
            cli: cli_message,
        })
    }
}

impl<P, R> CredentialProvider for CredentialBootstrapper<P, R>
where
    P: Provider,
    R: CommandRunner,
{
    fn credential(&self) -> CredentialFuture<'_> {
        Box::pin(self.ensure())
    }
}
