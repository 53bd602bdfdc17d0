//! Local key pair storage at a fixed, predictable location.
//!
//! The public key file is the existence check: when it is missing the key
//! pair is generated with `ssh-keygen` before anything is registered.

use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::info;

use super::{Credential, CredentialError};
use crate::shell::{CommandRunner, expand_tilde};

/// Comment embedded in generated public keys.
pub const DEFAULT_KEY_COMMENT: &str = "vastfleet-automation";

/// Location and generator settings for the fleet key pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyStore {
    private_key: Utf8PathBuf,
    keygen_bin: String,
    comment: String,
}

impl KeyStore {
    /// Creates a store for the private key at `private_key`; the public key
    /// lives next to it with a `.pub` suffix.
    #[must_use]
    pub fn new(private_key: impl Into<Utf8PathBuf>, keygen_bin: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            keygen_bin: keygen_bin.into(),
            comment: DEFAULT_KEY_COMMENT.to_owned(),
        }
    }

    /// Creates a store from a configured path, expanding a leading `~/`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Location`] when the path is blank or still
    /// relative to the home directory after expansion.
    pub fn from_config_path(raw: &str, keygen_bin: &str) -> Result<Self, CredentialError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CredentialError::Location(String::from(
                "key path is empty",
            )));
        }
        let expanded = expand_tilde(trimmed);
        if expanded.starts_with('~') {
            return Err(CredentialError::Location(format!(
                "cannot expand {trimmed}: HOME is not set"
            )));
        }
        Ok(Self::new(expanded, keygen_bin))
    }

    /// Path to the private key.
    #[must_use]
    pub fn private_key(&self) -> &Utf8Path {
        &self.private_key
    }

    /// Path to the public key.
    #[must_use]
    pub fn public_key(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.pub", self.private_key))
    }

    /// Returns `true` when the public key file exists.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] when the directory cannot be
    /// inspected.
    pub fn has_key_pair(&self) -> Result<bool, CredentialError> {
        exists(&self.public_key())
    }

    /// Returns the key pair, generating it first when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the directory cannot be created,
    /// the generator fails, or the public key cannot be read.
    pub async fn ensure_key_pair<R: CommandRunner + ?Sized>(
        &self,
        runner: &R,
    ) -> Result<Credential, CredentialError> {
        if !self.has_key_pair()? {
            self.generate(runner).await?;
        }

        let public_key = read(&self.public_key())?.trim().to_owned();
        if public_key.is_empty() {
            return Err(CredentialError::Generation(format!(
                "{} is empty",
                self.public_key()
            )));
        }

        Ok(Credential {
            private_key: self.private_key.clone(),
            public_key,
        })
    }

    async fn generate<R: CommandRunner + ?Sized>(&self, runner: &R) -> Result<(), CredentialError> {
        let parent = parent_of(&self.private_key);
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            CredentialError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;

        if exists(&self.private_key)? {
            return self.derive_public_key(runner).await;
        }

        info!(path = %self.private_key, "creating ssh key pair");
        let args = [
            OsString::from("-t"),
            OsString::from("ed25519"),
            OsString::from("-f"),
            OsString::from(self.private_key.as_str()),
            OsString::from("-N"),
            OsString::from(""),
            OsString::from("-C"),
            OsString::from(self.comment.as_str()),
            OsString::from("-q"),
        ];
        let output = runner
            .run(&self.keygen_bin, &args)
            .await
            .map_err(|err| CredentialError::Generation(err.to_string()))?;
        if !output.is_success() {
            return Err(CredentialError::Generation(format!(
                "{} exited with status {}: {}",
                self.keygen_bin,
                output.status_text(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Rebuilds a missing public key from an existing private key.
    async fn derive_public_key<R: CommandRunner + ?Sized>(
        &self,
        runner: &R,
    ) -> Result<(), CredentialError> {
        info!(path = %self.private_key, "deriving missing public key");
        let args = [
            OsString::from("-y"),
            OsString::from("-f"),
            OsString::from(self.private_key.as_str()),
        ];
        let output = runner
            .run(&self.keygen_bin, &args)
            .await
            .map_err(|err| CredentialError::Generation(err.to_string()))?;
        if !output.is_success() {
            return Err(CredentialError::Generation(format!(
                "{} -y exited with status {}: {}",
                self.keygen_bin,
                output.status_text(),
                output.stderr.trim()
            )));
        }
        write(&self.public_key(), &output.stdout)
    }
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), CredentialError> {
    let parent = parent_of(path);
    try_open_parent(path)?.ok_or_else(|| CredentialError::Io {
        path: parent.to_path_buf(),
        message: String::from("directory does not exist"),
    })
}

/// Opens the directory holding `path`; `None` when it does not exist.
fn try_open_parent(path: &Utf8Path) -> Result<Option<(Dir, &str)>, CredentialError> {
    let parent = parent_of(path);
    let file_name = path.file_name().ok_or_else(|| CredentialError::Io {
        path: path.to_path_buf(),
        message: String::from("key path is missing a filename"),
    })?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => Ok(Some((dir, file_name))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CredentialError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn exists(path: &Utf8Path) -> Result<bool, CredentialError> {
    let Some((dir, file_name)) = try_open_parent(path)? else {
        return Ok(false);
    };
    dir.try_exists(file_name).map_err(|err| CredentialError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read(path: &Utf8Path) -> Result<String, CredentialError> {
    let (dir, file_name) = open_parent(path)?;
    dir.read_to_string(file_name)
        .map_err(|err| CredentialError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn write(path: &Utf8Path, contents: &str) -> Result<(), CredentialError> {
    let (dir, file_name) = open_parent(path)?;
    dir.write(file_name, contents)
        .map_err(|err| CredentialError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}
