//! Configuration loading via `ortho-config`.
//!
//! Settings are split by concern: [`VastConfig`] covers the marketplace
//! API and deployment template, [`FleetConfig`] covers provisioning and
//! readiness pacing plus the local key, and [`TaskConfig`] covers SSH and
//! the remote task. Each merges defaults, `vastfleet.toml`, and
//! environment variables in that order of precedence.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::credential::KeyStore;
use crate::dispatch::{StageTimeouts, TaskPlan};
use crate::provider::{DeploymentTemplate, OfferFilter};
use crate::shell::SshOptions;
use crate::vast::DEFAULT_API_URL;

/// Configuration file name searched for by every loader.
pub const CONFIG_FILE_NAME: &str = "vastfleet.toml";

/// Container image deployed when none is configured.
pub const DEFAULT_IMAGE: &str = "vastai/linux-desktop:@vastai-automatic-tag";

/// Marketplace API and deployment template settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VAST",
    discovery(
        app_name = "vastfleet",
        env_var = "VASTFLEET_CONFIG_PATH",
        config_file_name = "vastfleet.toml",
        dotfile_name = ".vastfleet.toml",
        project_file_name = "vastfleet.toml"
    )
)]
pub struct VastConfig {
    /// API key sent as a bearer token. Required.
    pub api_key: String,
    /// API base URL.
    #[ortho_config(default = DEFAULT_API_URL.to_owned())]
    pub api_url: String,
    /// Per-request timeout in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
    /// Marketplace CLI used as the key registration fallback.
    #[ortho_config(default = "vastai".to_owned())]
    pub cli_bin: String,
    /// Saved template identifier, when deploying from a template.
    pub template_id: Option<u64>,
    /// Saved template hash, paired with `template_id`.
    pub template_hash_id: Option<String>,
    /// Container image reference.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub template_image: String,
    /// Comma separated container ports to expose.
    #[ortho_config(default = "1111,6100,6200,5900,8384".to_owned())]
    pub template_ports: String,
    /// Comma separated `KEY=VALUE` environment entries.
    #[ortho_config(default = "DATA_DIRECTORY=/workspace/,JUPYTER_DIR=/".to_owned())]
    pub template_env: String,
    /// Command run when the container starts.
    #[ortho_config(default = "entrypoint.sh".to_owned())]
    pub template_onstart: String,
    /// Provider run type.
    #[ortho_config(default = "jupyter_direc ssh_direc ssh_proxy".to_owned())]
    pub template_runtype: String,
    /// Disk size in gigabytes.
    #[ortho_config(default = 32)]
    pub template_disk_gb: u32,
    /// Minimum rental duration in seconds.
    #[ortho_config(default = 259_200)]
    pub template_min_duration_secs: u64,
    /// Minimum disk space required of offers, in gigabytes.
    #[ortho_config(default = 30)]
    pub min_disk_gb: u32,
    /// Maximum number of offers fetched per search.
    #[ortho_config(default = 10)]
    pub page_limit: u32,
}

/// Provisioning, readiness, and key settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VASTFLEET",
    discovery(
        app_name = "vastfleet",
        env_var = "VASTFLEET_CONFIG_PATH",
        config_file_name = "vastfleet.toml",
        dotfile_name = ".vastfleet.toml",
        project_file_name = "vastfleet.toml"
    )
)]
pub struct FleetConfig {
    /// Comma separated accelerator model substrings never rented.
    #[ortho_config(default = "3090,4090".to_owned())]
    pub excluded_models: String,
    /// Maximum simultaneous creation requests.
    #[ortho_config(default = 1)]
    pub max_concurrent_creates: usize,
    /// Minimum spacing between creation requests, in milliseconds.
    #[ortho_config(default = 250)]
    pub request_spacing_ms: u64,
    /// Interval between status lookups for a single instance, in seconds.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Interval between fleet readiness progress reports, in seconds.
    #[ortho_config(default = 60)]
    pub fleet_check_interval_secs: u64,
    /// Private key location; the public key sits beside it with `.pub`.
    #[ortho_config(default = "~/.ssh/vastfleet_ed25519".to_owned())]
    pub key_path: String,
    /// Key generator executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub keygen_bin: String,
}

/// SSH transport and remote task settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VASTFLEET_TASK",
    discovery(
        app_name = "vastfleet",
        env_var = "VASTFLEET_CONFIG_PATH",
        config_file_name = "vastfleet.toml",
        dotfile_name = ".vastfleet.toml",
        project_file_name = "vastfleet.toml"
    )
)]
pub struct TaskConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; rented hosts are ephemeral.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// SSH connect timeout in seconds.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// URL prefix artifacts are downloaded from. Required when dispatching
    /// with artifacts configured.
    pub artifact_base_url: Option<String>,
    /// Comma separated artifact file names.
    #[ortho_config(default = "start.sh".to_owned())]
    pub artifacts: String,
    /// Command launched detached; receives the instance id.
    #[ortho_config(default = "./start.sh".to_owned())]
    pub launch_command: String,
    /// Pattern checked in the remote process list after launch.
    #[ortho_config(default = "start.sh".to_owned())]
    pub process_pattern: String,
    /// Remote file receiving task output.
    #[ortho_config(default = "task_output.log".to_owned())]
    pub log_file: String,
    /// Connectivity probe budget, in seconds.
    #[ortho_config(default = 10)]
    pub probe_timeout_secs: u64,
    /// Artifact retrieval budget, in seconds.
    #[ortho_config(default = 120)]
    pub fetch_timeout_secs: u64,
    /// Launch budget, in seconds.
    #[ortho_config(default = 30)]
    pub launch_timeout_secs: u64,
    /// Presence check budget, in seconds.
    #[ortho_config(default = 10)]
    pub confirm_timeout_secs: u64,
    /// Pause between launch and the presence check, in seconds.
    #[ortho_config(default = 2)]
    pub confirm_delay_secs: u64,
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field holds a value that cannot be used.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Field that failed validation.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in {CONFIG_FILE_NAME}",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn app_args() -> [OsString; 1] {
    [OsString::from("vastfleet")]
}

impl VastConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, including when
    /// the API key is absent from every source.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(app_args()).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks required fields and list syntax.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and TOML key for blank required values, or [`ConfigError::Invalid`]
    /// for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("Vast API key", "VAST_API_KEY", "api_key", "vast")
            .require(&self.api_key)?;
        FieldMetadata::new("Vast API URL", "VAST_API_URL", "api_url", "vast")
            .require(&self.api_url)?;
        FieldMetadata::new("container image", "VAST_TEMPLATE_IMAGE", "template_image", "vast")
            .require(&self.template_image)?;
        if self.page_limit == 0 {
            return Err(invalid("page_limit", "must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be at least 1"));
        }
        parse_ports(&self.template_ports)?;
        parse_env(&self.template_env)?;
        Ok(())
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Builds the search filter.
    #[must_use]
    pub const fn offer_filter(&self, verified_only: bool) -> OfferFilter {
        OfferFilter {
            min_disk_gb: self.min_disk_gb,
            verified_only,
            limit: self.page_limit,
        }
    }

    /// Builds the deployment template sent with every creation request.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the port or environment lists
    /// cannot be parsed.
    pub fn deployment_template(&self) -> Result<DeploymentTemplate, ConfigError> {
        Ok(DeploymentTemplate {
            template_id: self.template_id,
            template_hash_id: self
                .template_hash_id
                .as_deref()
                .map(str::trim)
                .filter(|hash| !hash.is_empty())
                .map(str::to_owned),
            image: self.template_image.trim().to_owned(),
            ports: parse_ports(&self.template_ports)?,
            env: parse_env(&self.template_env)?,
            onstart: self.template_onstart.clone(),
            runtype: self.template_runtype.clone(),
            disk_gb: self.template_disk_gb,
            min_duration_secs: self.template_min_duration_secs,
        })
    }
}

impl FleetConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(app_args()).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks required fields and intervals.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("SSH key path", "VASTFLEET_KEY_PATH", "key_path", "fleet")
            .require(&self.key_path)?;
        FieldMetadata::new("key generator", "VASTFLEET_KEYGEN_BIN", "keygen_bin", "fleet")
            .require(&self.keygen_bin)?;
        if self.max_concurrent_creates == 0 {
            return Err(invalid("max_concurrent_creates", "must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs", "must be at least 1"));
        }
        if self.fleet_check_interval_secs == 0 {
            return Err(invalid("fleet_check_interval_secs", "must be at least 1"));
        }
        Ok(())
    }

    /// Accelerator model substrings to exclude.
    #[must_use]
    pub fn excluded_models(&self) -> Vec<String> {
        split_list(&self.excluded_models)
    }

    /// Minimum spacing between creation requests.
    #[must_use]
    pub const fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.request_spacing_ms)
    }

    /// Interval between single-instance status lookups.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Interval between fleet readiness rounds.
    #[must_use]
    pub const fn fleet_check_interval(&self) -> Duration {
        Duration::from_secs(self.fleet_check_interval_secs)
    }

    /// Builds the key store for the configured key location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the path cannot be resolved.
    pub fn key_store(&self) -> Result<KeyStore, ConfigError> {
        KeyStore::from_config_path(&self.key_path, self.keygen_bin.trim())
            .map_err(|err| invalid("key_path", err.to_string()))
    }
}

impl TaskConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(app_args()).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks SSH settings and, when `dispatching`, the task settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and TOML key for the first blank required value.
    pub fn validate(&self, dispatching: bool) -> Result<(), ConfigError> {
        FieldMetadata::new("ssh executable", "VASTFLEET_TASK_SSH_BIN", "ssh_bin", "task")
            .require(&self.ssh_bin)?;
        FieldMetadata::new("ssh user", "VASTFLEET_TASK_SSH_USER", "ssh_user", "task")
            .require(&self.ssh_user)?;
        if !dispatching {
            return Ok(());
        }
        FieldMetadata::new(
            "launch command",
            "VASTFLEET_TASK_LAUNCH_COMMAND",
            "launch_command",
            "task",
        )
        .require(&self.launch_command)?;
        FieldMetadata::new(
            "process pattern",
            "VASTFLEET_TASK_PROCESS_PATTERN",
            "process_pattern",
            "task",
        )
        .require(&self.process_pattern)?;
        FieldMetadata::new("task log file", "VASTFLEET_TASK_LOG_FILE", "log_file", "task")
            .require(&self.log_file)?;
        if !split_list(&self.artifacts).is_empty() {
            FieldMetadata::new(
                "artifact base URL",
                "VASTFLEET_TASK_ARTIFACT_BASE_URL",
                "artifact_base_url",
                "task",
            )
            .require(self.artifact_base_url.as_deref().unwrap_or_default())?;
        }
        Ok(())
    }

    /// Builds SSH options authenticating with `identity_file`.
    #[must_use]
    pub fn ssh_options(&self, identity_file: Option<Utf8PathBuf>) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            user: self.ssh_user.clone(),
            identity_file,
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
        }
    }

    /// Builds the remote task plan.
    #[must_use]
    pub fn task_plan(&self) -> TaskPlan {
        TaskPlan {
            artifact_base_url: self
                .artifact_base_url
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_owned(),
            artifacts: split_list(&self.artifacts),
            launch_command: self.launch_command.trim().to_owned(),
            process_pattern: self.process_pattern.trim().to_owned(),
            log_file: self.log_file.trim().to_owned(),
            timeouts: StageTimeouts {
                probe: Duration::from_secs(self.probe_timeout_secs),
                fetch: Duration::from_secs(self.fetch_timeout_secs),
                launch: Duration::from_secs(self.launch_timeout_secs),
                confirm: Duration::from_secs(self.confirm_timeout_secs),
            },
            confirm_delay: Duration::from_secs(self.confirm_delay_secs),
        }
    }
}

/// Splits a comma separated setting into trimmed, non-blank items.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses a comma separated port list.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] naming the first entry that is not a
/// port number.
pub fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    split_list(raw)
        .iter()
        .map(|entry| {
            entry
                .parse::<u16>()
                .map_err(|err| invalid("template_ports", format!("{entry:?}: {err}")))
        })
        .collect()
}

/// Parses comma separated `KEY=VALUE` entries.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for an entry without `=` or with a
/// blank key.
pub fn parse_env(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    split_list(raw)
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => Err(invalid(
                "template_env",
                format!("{entry:?} is not a KEY=VALUE pair"),
            )),
        })
        .collect()
}
