//! Remote task dispatch over SSH.
//!
//! Every ready instance runs the same staged pipeline: a connectivity
//! probe, artifact retrieval, a detached launch, and a best-effort check
//! that the launched process is alive. A failed stage ends the pipeline
//! for that instance only; all instances run in parallel and each yields
//! exactly one [`TaskOutcome`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::readiness::ReadyInstance;
use crate::shell::{CommandOutput, CommandRunner, SshOptions, run_with_timeout};

mod plan;

pub use plan::{StageTimeouts, TaskPlan};

/// Pipeline stage, used in logs and failure messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Connectivity probe.
    Probe,
    /// Artifact retrieval.
    Fetch,
    /// Detached task launch.
    Launch,
    /// Process presence check.
    Confirm,
}

impl Stage {
    /// Returns the lowercase stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Fetch => "fetch",
            Self::Launch => "launch",
            Self::Confirm => "confirm",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of dispatching the task to one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    /// The instance could not be reached over SSH.
    ConnectivityFailed {
        /// Failure description.
        reason: String,
    },
    /// Artifacts could not be downloaded.
    FetchFailed {
        /// Failure description.
        reason: String,
    },
    /// The task could not be started.
    LaunchFailed {
        /// Failure description.
        reason: String,
    },
    /// The task was started but its process could not be observed.
    LaunchedUnconfirmed {
        /// Process id reported by the launch stage.
        pid: Option<u32>,
    },
    /// The task was started and its process was observed running.
    LaunchedConfirmed {
        /// Process id reported by the launch stage.
        pid: Option<u32>,
    },
}

impl TaskOutcome {
    /// Returns `true` when the task was launched, confirmed or not.
    #[must_use]
    pub const fn is_launched(&self) -> bool {
        matches!(
            self,
            Self::LaunchedUnconfirmed { .. } | Self::LaunchedConfirmed { .. }
        )
    }
}

/// Outcome of dispatch for one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskRecord {
    /// Position of the instance in the dispatched list.
    pub index: usize,
    /// Instance the pipeline ran against.
    pub instance: ReadyInstance,
    /// Terminal outcome.
    pub outcome: TaskOutcome,
}

/// Count of outcomes per category.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutcomeTally {
    /// Instances that failed the connectivity probe.
    pub connectivity_failed: usize,
    /// Instances that failed artifact retrieval.
    pub fetch_failed: usize,
    /// Instances that failed to launch.
    pub launch_failed: usize,
    /// Launched instances whose process was not observed.
    pub launched_unconfirmed: usize,
    /// Launched instances whose process was observed.
    pub launched_confirmed: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &TaskOutcome) {
        let slot = match outcome {
            TaskOutcome::ConnectivityFailed { .. } => &mut self.connectivity_failed,
            TaskOutcome::FetchFailed { .. } => &mut self.fetch_failed,
            TaskOutcome::LaunchFailed { .. } => &mut self.launch_failed,
            TaskOutcome::LaunchedUnconfirmed { .. } => &mut self.launched_unconfirmed,
            TaskOutcome::LaunchedConfirmed { .. } => &mut self.launched_confirmed,
        };
        *slot += 1;
    }
}

/// Aggregate result of dispatching to a fleet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DispatchReport {
    /// One record per instance, ordered by input position.
    pub records: Vec<TaskRecord>,
}

impl DispatchReport {
    /// Number of instances dispatched to.
    #[must_use]
    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Number of instances where the task was launched.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome.is_launched())
            .count()
    }

    /// Number of instances where a stage failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// Outcome counts per category.
    #[must_use]
    pub fn tally(&self) -> OutcomeTally {
        let mut tally = OutcomeTally::default();
        for record in &self.records {
            tally.record(&record.outcome);
        }
        tally
    }

    /// Fraction of instances where the task was launched, in `0.0..=1.0`.
    /// An empty report has a rate of zero.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        clippy::cast_precision_loss,
        reason = "success rate is a reporting ratio over small instance counts"
    )]
    pub fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.succeeded() as f64 / self.total() as f64
    }
}

/// Runs the task pipeline on ready instances.
pub struct TaskDispatcher<R> {
    runner: Arc<R>,
    ssh: Arc<SshOptions>,
    plan: Arc<TaskPlan>,
}

impl<R> fmt::Debug for TaskDispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("ssh", &self.ssh)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner + 'static> TaskDispatcher<R> {
    /// Creates a dispatcher running `plan` through `runner` with `ssh`.
    #[must_use]
    pub fn new(runner: Arc<R>, ssh: SshOptions, plan: TaskPlan) -> Self {
        Self {
            runner,
            ssh: Arc::new(ssh),
            plan: Arc::new(plan),
        }
    }

    /// Runs the pipeline on every instance in parallel and waits for all of
    /// them to reach a terminal outcome.
    pub async fn dispatch(&self, instances: &[ReadyInstance]) -> DispatchReport {
        info!(count = instances.len(), "dispatching task to ready instances");
        for instance in instances {
            info!(instance_id = %instance.id(), endpoint = %instance.endpoint, "dispatch target");
        }

        let records = Arc::new(Mutex::new(Vec::with_capacity(instances.len())));
        let mut workers = JoinSet::new();
        for (index, instance) in instances.iter().cloned().enumerate() {
            let pipeline = Pipeline {
                runner: Arc::clone(&self.runner),
                ssh: Arc::clone(&self.ssh),
                plan: Arc::clone(&self.plan),
            };
            let sink = Arc::clone(&records);
            workers.spawn(async move {
                let outcome = pipeline.run(&instance).await;
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(TaskRecord {
                        index,
                        instance,
                        outcome,
                    });
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "dispatch worker terminated abnormally");
            }
        }

        let mut collected = std::mem::take(
            &mut *records.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (index, instance) in instances.iter().enumerate() {
            if !collected.iter().any(|record| record.index == index) {
                collected.push(TaskRecord {
                    index,
                    instance: instance.clone(),
                    outcome: TaskOutcome::LaunchFailed {
                        reason: String::from("dispatch worker aborted before reporting"),
                    },
                });
            }
        }
        collected.sort_by_key(|record| record.index);

        let report = DispatchReport { records: collected };
        info!(
            total = report.total(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "dispatch finished"
        );
        report
    }
}

struct Pipeline<R> {
    runner: Arc<R>,
    ssh: Arc<SshOptions>,
    plan: Arc<TaskPlan>,
}

impl<R: CommandRunner> Pipeline<R> {
    async fn run(&self, instance: &ReadyInstance) -> TaskOutcome {
        let timeouts = self.plan.timeouts;

        if let Err(reason) = self
            .stage(Stage::Probe, instance, &TaskPlan::probe_command(), timeouts.probe)
            .await
        {
            return TaskOutcome::ConnectivityFailed { reason };
        }

        if let Some(fetch) = self.plan.fetch_command()
            && let Err(reason) = self.stage(Stage::Fetch, instance, &fetch, timeouts.fetch).await
        {
            return TaskOutcome::FetchFailed { reason };
        }

        let launch = self.plan.launch_command(instance.id());
        let pid = match self.stage(Stage::Launch, instance, &launch, timeouts.launch).await {
            Ok(output) => parse_pid(&output.stdout),
            Err(reason) => return TaskOutcome::LaunchFailed { reason },
        };
        info!(instance_id = %instance.id(), pid = ?pid, "task launched");

        sleep(self.plan.confirm_delay).await;
        let confirm = self.plan.confirm_command();
        match self
            .stage(Stage::Confirm, instance, &confirm, timeouts.confirm)
            .await
        {
            Ok(output) if !output.stdout.trim().is_empty() => {
                info!(instance_id = %instance.id(), "task process confirmed running");
                TaskOutcome::LaunchedConfirmed { pid }
            }
            Ok(_) | Err(_) => {
                warn!(instance_id = %instance.id(), "task process not found after launch");
                TaskOutcome::LaunchedUnconfirmed { pid }
            }
        }
    }

    async fn stage(
        &self,
        stage: Stage,
        instance: &ReadyInstance,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput, String> {
        let instance_id = instance.id();
        info!(%instance_id, %stage, "stage started");
        let args = self.ssh.command_args(&instance.endpoint, command);
        let result = run_with_timeout(&*self.runner, &self.ssh.ssh_bin, &args, limit).await;

        let failure = match result {
            Ok(output) if output.is_success() => {
                info!(%instance_id, %stage, output = %output.stdout.trim(), "stage succeeded");
                return Ok(output);
            }
            Ok(output) => format!(
                "{stage} exited with status {}: {}",
                output.status_text(),
                output.stderr.trim()
            ),
            Err(err) => format!("{stage} failed: {err}"),
        };
        warn!(%instance_id, %stage, reason = %failure, "stage failed");
        Err(failure)
    }
}

/// Extracts the process id echoed by the launch command.
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

#[cfg(test)]
mod tests;
