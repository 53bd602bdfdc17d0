//! Remote command strings for each pipeline stage.

use std::borrow::Cow;
use std::time::Duration;

use shell_escape::unix::escape;

use crate::provider::InstanceId;

/// Per-stage time budgets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StageTimeouts {
    /// Connectivity probe.
    pub probe: Duration,
    /// Artifact retrieval.
    pub fetch: Duration,
    /// Detached launch.
    pub launch: Duration,
    /// Process presence check.
    pub confirm: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(10),
            fetch: Duration::from_secs(120),
            launch: Duration::from_secs(30),
            confirm: Duration::from_secs(10),
        }
    }
}

/// Describes the task shipped to each instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskPlan {
    /// URL prefix the artifacts are downloaded from.
    pub artifact_base_url: String,
    /// Artifact file names, fetched into the remote working directory and
    /// marked executable.
    pub artifacts: Vec<String>,
    /// Command started detached; the instance id is appended as its last
    /// argument.
    pub launch_command: String,
    /// Literal text searched for in the remote process list after launch.
    pub process_pattern: String,
    /// Remote file receiving the task output.
    pub log_file: String,
    /// Per-stage time budgets.
    pub timeouts: StageTimeouts,
    /// Pause between launch and the presence check.
    pub confirm_delay: Duration,
}

impl TaskPlan {
    /// Command used to check the instance accepts SSH sessions.
    #[must_use]
    pub fn probe_command() -> String {
        String::from("echo 'ssh connection ok'")
    }

    /// Command downloading every artifact, or `None` when there are none.
    #[must_use]
    pub fn fetch_command(&self) -> Option<String> {
        if self.artifacts.is_empty() {
            return None;
        }
        let base = self.artifact_base_url.trim_end_matches('/');
        let names: Vec<Cow<'_, str>> = self
            .artifacts
            .iter()
            .map(|name| escape(Cow::from(name.as_str())))
            .collect();

        let mut steps: Vec<String> = self
            .artifacts
            .iter()
            .zip(&names)
            .map(|(name, escaped)| {
                let url = format!("{base}/{name}");
                format!("wget -q -O {escaped} {}", escape(Cow::from(url.as_str())))
            })
            .collect();
        let listed = names.join(" ");
        steps.push(format!("chmod +x {listed}"));
        steps.push(format!("ls -la {listed}"));
        Some(steps.join(" && "))
    }

    /// Command starting the task detached and echoing its process id.
    #[must_use]
    pub fn launch_command(&self, instance_id: InstanceId) -> String {
        format!(
            "nohup {} {instance_id} > {} 2>&1 & echo $!",
            self.launch_command,
            escape(Cow::from(self.log_file.as_str()))
        )
    }

    /// Command listing processes that match the task pattern.
    ///
    /// The pattern is turned into a regular expression whose first
    /// alphanumeric character sits in a bracket expression, so the remote
    /// shell running the check never matches its own command line.
    #[must_use]
    pub fn confirm_command(&self) -> String {
        format!(
            "pgrep -f {}",
            escape(Cow::from(self_excluding_pattern(&self.process_pattern)))
        )
    }
}

/// Escapes `literal` for `pgrep` and brackets its first alphanumeric
/// character.
fn self_excluding_pattern(literal: &str) -> String {
    let mut pattern = String::with_capacity(literal.len() + 2);
    let mut bracketed = false;
    for ch in literal.chars() {
        if !bracketed && ch.is_ascii_alphanumeric() {
            pattern.push('[');
            pattern.push(ch);
            pattern.push(']');
            bracketed = true;
        } else {
            if ".[]{}()*+?^$|\\".contains(ch) {
                pattern.push('\\');
            }
            pattern.push(ch);
        }
    }
    pattern
}
