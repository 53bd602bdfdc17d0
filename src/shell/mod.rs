//! Local process execution and SSH command construction.
//!
//! Every remote operation in the fleet workflow is an invocation of the
//! system `ssh` client, and credential bootstrap shells out to `ssh-keygen`
//! and the marketplace CLI. The [`CommandRunner`] trait keeps those calls
//! behind one seam so tests can script outcomes without spawning processes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::provider::Endpoint;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Describes the exit status for log and error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while running local commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command does not finish within its time budget. The
    /// child process is killed.
    #[error("{program} did not finish within {seconds}s")]
    Timeout {
        /// Command that was cancelled.
        program: String,
        /// Time budget in whole seconds.
        seconds: u64,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ShellError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Dropping the returned future must terminate the child process.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        (**self).run(program, args)
    }
}

/// Runs a command with a time budget.
///
/// # Errors
///
/// Returns [`ShellError::Timeout`] when `limit` elapses first, or the
/// runner's own error when the command cannot be spawned.
pub async fn run_with_timeout<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
    limit: Duration,
) -> Result<CommandOutput, ShellError> {
    timeout(limit, runner.run(program, args))
        .await
        .map_err(|_| ShellError::Timeout {
            program: program.to_owned(),
            seconds: limit.as_secs(),
        })?
}

/// Real command runner backed by `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| ShellError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Options applied to every `ssh` invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user to connect as.
    pub user: String,
    /// Private key used for authentication.
    pub identity_file: Option<Utf8PathBuf>,
    /// Whether to force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; blank leaves the client default.
    pub known_hosts_file: String,
    /// TCP connect timeout passed to the client.
    pub connect_timeout: Duration,
}

impl SshOptions {
    /// Builds the argument list for running `command` on `endpoint`.
    #[must_use]
    pub fn command_args(&self, endpoint: &Endpoint, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(endpoint.port.to_string()),
        ];

        if let Some(ref identity_file) = self.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file.as_str()));
        }

        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        )));

        args.push(OsString::from(format!("{}@{}", self.user, endpoint.host)));
        args.push(OsString::from(command));
        args
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
