//! Polling of instance status until each instance is reachable.
//!
//! [`ReadinessPoller::wait_until_ready`] follows a single instance through
//! a bounded number of status lookups. [`ReadinessPoller::poll_fleet`]
//! runs that loop for every instance at once under one shared deadline,
//! then looks each instance up one last time before reporting.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::provider::{
    Endpoint, Instance, InstanceHandle, InstanceId, InstanceStatus, Provider, ProviderError,
    StatusReport,
};

/// Default interval between status lookups for a single instance.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout applied to the informational SSH port probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout applied to each lookup of the final status sweep.
pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

type Outcome = Result<ReadyInstance, ReadinessError>;
type SweepAnswer = Result<Result<StatusReport, ProviderError>, Elapsed>;

/// Errors raised while waiting for one instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// The attempt budget ran out before the instance became ready.
    #[error("instance {instance_id} not ready after {attempts} attempts (last status: {last_status})")]
    Timeout {
        /// Instance being polled.
        instance_id: InstanceId,
        /// Number of status lookups made.
        attempts: u32,
        /// Last status observed.
        last_status: InstanceStatus,
    },
    /// The provider rejected a status lookup.
    #[error("status lookup for instance {instance_id} failed: {source}")]
    Provider {
        /// Instance being polled.
        instance_id: InstanceId,
        /// Provider failure.
        source: ProviderError,
    },
    /// The instance was ready but the final lookup found it elsewhere.
    #[error("instance {instance_id} was ready but is now {status}")]
    Regressed {
        /// Instance being polled.
        instance_id: InstanceId,
        /// Status reported by the final lookup.
        status: InstanceStatus,
    },
}

impl ReadinessError {
    /// Instance the error refers to.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        match self {
            Self::Timeout { instance_id, .. }
            | Self::Provider { instance_id, .. }
            | Self::Regressed { instance_id, .. } => *instance_id,
        }
    }
}

/// An instance that reached the running state with an endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadyInstance {
    /// Creation-time attributes.
    pub handle: InstanceHandle,
    /// Reachable SSH endpoint.
    pub endpoint: Endpoint,
}

impl ReadyInstance {
    /// Provider identifier.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.handle.id
    }

    fn from_instance(instance: &Instance) -> Option<Self> {
        if !instance.is_ready() {
            return None;
        }
        instance.endpoint().map(|endpoint| Self {
            handle: instance.handle().clone(),
            endpoint: endpoint.clone(),
        })
    }
}

/// A created instance that was not ready when the wait ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotReady {
    /// The instance with its last observed status.
    pub instance: Instance,
    /// Why the instance is not ready.
    pub error: ReadinessError,
}

/// Result of waiting for a whole fleet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FleetReadiness {
    /// Instances that became ready, in input order.
    pub ready: Vec<ReadyInstance>,
    /// Instances that did not, in input order.
    pub not_ready: Vec<NotReady>,
}

/// Polls instance status through a [`Provider`].
#[derive(Debug)]
pub struct ReadinessPoller<P> {
    provider: Arc<P>,
    interval: Duration,
    probe_timeout: Duration,
    sweep_timeout: Duration,
}

impl<P> Clone for ReadinessPoller<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            interval: self.interval,
            probe_timeout: self.probe_timeout,
            sweep_timeout: self.sweep_timeout,
        }
    }
}

impl<P: Provider> ReadinessPoller<P> {
    /// Creates a poller that looks up status every `interval`.
    #[must_use]
    pub const fn new(provider: Arc<P>, interval: Duration) -> Self {
        Self {
            provider,
            interval,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            sweep_timeout: DEFAULT_SWEEP_TIMEOUT,
        }
    }

    /// Overrides the SSH probe timeout used during fleet waits.
    #[must_use]
    pub const fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Overrides the per-lookup timeout of the final status sweep.
    #[must_use]
    pub const fn with_sweep_timeout(mut self, sweep_timeout: Duration) -> Self {
        self.sweep_timeout = sweep_timeout;
        self
    }

    /// Number of lookups that fit in `max_wait`, rounded up, at least one.
    #[must_use]
    pub fn attempts_for(&self, max_wait: Duration) -> u32 {
        attempts_within(max_wait, self.interval)
    }

    /// Polls `instance` until it is running with an endpoint.
    ///
    /// Transport failures count as an unsuccessful attempt; the poller
    /// sleeps one interval between attempts but not after the last.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] after exactly
    /// [`Self::attempts_for`] lookups without success, or
    /// [`ReadinessError::Provider`] when the provider rejects a lookup.
    pub async fn wait_until_ready(
        &self,
        instance: &mut Instance,
        max_wait: Duration,
    ) -> Result<ReadyInstance, ReadinessError> {
        self.poll_instance(instance, self.attempts_for(max_wait), None)
            .await
    }

    /// Runs the attempt loop, cutting it short at `deadline` when given.
    async fn poll_instance(
        &self,
        instance: &mut Instance,
        attempts: u32,
        deadline: Option<Instant>,
    ) -> Outcome {
        let instance_id = instance.id();
        info!(%instance_id, attempts, "waiting for instance to become ready");

        let mut made = 0;
        for attempt in 1..=attempts {
            if attempt > 1 && deadline.is_some_and(|limit| Instant::now() >= limit) {
                break;
            }
            made = attempt;
            let Some(looked_up) = self.lookup(instance_id, deadline).await else {
                warn!(%instance_id, attempt, "status lookup still pending at deadline");
                break;
            };
            match looked_up {
                Ok(report) => {
                    instance.observe(report);
                    if let Some(ready) = ReadyInstance::from_instance(instance) {
                        info!(%instance_id, endpoint = %ready.endpoint, "instance ready");
                        return Ok(ready);
                    }
                    info!(%instance_id, attempt, status = %instance.status(), "instance not ready");
                }
                Err(err) if err.is_transient() => {
                    warn!(%instance_id, attempt, error = %err, "status lookup failed");
                }
                Err(source) => {
                    warn!(%instance_id, error = %source, "status lookup rejected; giving up on instance");
                    return Err(ReadinessError::Provider {
                        instance_id,
                        source,
                    });
                }
            }

            if attempt < attempts {
                let wake = Instant::now() + self.interval;
                sleep_until(deadline.map_or(wake, |limit| wake.min(limit))).await;
            }
        }

        Err(ReadinessError::Timeout {
            instance_id,
            attempts: made,
            last_status: instance.status(),
        })
    }

    /// Looks up status; `None` when `deadline` passes first.
    async fn lookup(
        &self,
        instance_id: InstanceId,
        deadline: Option<Instant>,
    ) -> Option<Result<StatusReport, ProviderError>> {
        let pending = self.provider.instance_status(instance_id);
        match deadline {
            Some(limit) => timeout_at(limit, pending).await.ok(),
            None => Some(pending.await),
        }
    }

    /// Logs whether a ready instance already accepts TCP connections.
    async fn report_reachability(&self, ready: &ReadyInstance, deadline: Instant) {
        let limit = (Instant::now() + self.probe_timeout)
            .min(deadline)
            .saturating_duration_since(Instant::now());
        let instance_id = ready.id();
        let endpoint = &ready.endpoint;
        if probe_endpoint(endpoint, limit).await {
            info!(%instance_id, %endpoint, "instance running; ssh reachable");
        } else {
            debug!(%instance_id, %endpoint, "instance running; ssh not yet reachable");
        }
    }
}

impl<P: Provider + 'static> ReadinessPoller<P> {
    /// Waits for a whole fleet for at most `max_wait`.
    ///
    /// Every instance is polled by its own task at the poller's interval,
    /// so a slow lookup delays only its own instance. Progress is logged
    /// every `check_interval`. Once every task has finished, or the
    /// deadline has passed, each instance is looked up once more and the
    /// ready list is built from that final sweep.
    pub async fn poll_fleet(
        &self,
        instances: Vec<Instance>,
        max_wait: Duration,
        check_interval: Duration,
    ) -> FleetReadiness {
        let total = instances.len();
        let attempts = self.attempts_for(max_wait);
        let deadline = Instant::now() + max_wait;
        let report_every = check_interval.max(MIN_REPORT_INTERVAL);
        info!(total, attempts, "waiting for fleet to become ready");

        let mut slots: Vec<(Instance, Option<Outcome>)> = instances
            .iter()
            .cloned()
            .map(|instance| (instance, None))
            .collect();
        let mut workers = JoinSet::new();
        for (index, mut instance) in instances.into_iter().enumerate() {
            let poller = self.clone();
            workers.spawn(async move {
                let outcome = poller
                    .poll_instance(&mut instance, attempts, Some(deadline))
                    .await;
                if let Ok(ready) = &outcome {
                    poller.report_reachability(ready, deadline).await;
                }
                (index, instance, outcome)
            });
        }

        let mut ready = 0_usize;
        let mut settled = 0_usize;
        let mut next_report = Instant::now() + report_every;
        loop {
            tokio::select! {
                next = workers.join_next() => {
                    let Some(joined) = next else { break };
                    match joined {
                        Ok((index, instance, outcome)) => {
                            settled += 1;
                            ready += usize::from(outcome.is_ok());
                            if let Some(slot) = slots.get_mut(index) {
                                *slot = (instance, Some(outcome));
                            }
                        }
                        Err(err) => warn!(error = %err, "readiness worker terminated abnormally"),
                    }
                }
                () = sleep_until(next_report) => {
                    info!(ready, settled, total, "fleet readiness check");
                    next_report += report_every;
                }
            }
        }

        let polled = slots
            .into_iter()
            .map(|(instance, recorded)| {
                let outcome = recorded.unwrap_or_else(|| {
                    Err(ReadinessError::Timeout {
                        instance_id: instance.id(),
                        attempts: 0,
                        last_status: instance.status(),
                    })
                });
                (instance, outcome)
            })
            .collect();
        self.sweep(polled).await
    }

    /// Looks every instance up once more, concurrently, and splits the
    /// fleet into ready and not ready from the answers.
    async fn sweep(&self, polled: Vec<(Instance, Outcome)>) -> FleetReadiness {
        info!(total = polled.len(), "checking instance status before reporting");
        let mut lookups = JoinSet::new();
        for (index, (instance, _)) in polled.iter().enumerate() {
            let provider = Arc::clone(&self.provider);
            let instance_id = instance.id();
            let limit = self.sweep_timeout;
            lookups.spawn(async move {
                (index, timeout(limit, provider.instance_status(instance_id)).await)
            });
        }

        let mut answers: Vec<Option<SweepAnswer>> = polled.iter().map(|_| None).collect();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((index, answer)) => {
                    if let Some(slot) = answers.get_mut(index) {
                        *slot = Some(answer);
                    }
                }
                Err(err) => warn!(error = %err, "status sweep task terminated abnormally"),
            }
        }

        let mut fleet = FleetReadiness::default();
        for ((polled_instance, outcome), answer) in polled.into_iter().zip(answers) {
            match revise(polled_instance, outcome, answer) {
                (_, Ok(ready)) => fleet.ready.push(ready),
                (instance, Err(error)) => fleet.not_ready.push(NotReady { instance, error }),
            }
        }
        info!(
            ready = fleet.ready.len(),
            not_ready = fleet.not_ready.len(),
            "fleet readiness settled"
        );
        fleet
    }
}

/// Applies the final sweep answer to an instance's polling outcome.
///
/// A failed or missing answer keeps the earlier outcome.
fn revise(
    mut instance: Instance,
    outcome: Outcome,
    answer: Option<SweepAnswer>,
) -> (Instance, Outcome) {
    let instance_id = instance.id();
    let report = match answer {
        Some(Ok(Ok(report))) => report,
        Some(Ok(Err(err))) => {
            warn!(%instance_id, error = %err, "final status lookup failed; keeping earlier result");
            return (instance, outcome);
        }
        Some(Err(_)) => {
            warn!(%instance_id, "final status lookup timed out; keeping earlier result");
            return (instance, outcome);
        }
        None => return (instance, outcome),
    };

    instance.observe(report);
    if let Some(ready) = ReadyInstance::from_instance(&instance) {
        return (instance, Ok(ready));
    }
    let status = instance.status();
    let revised = match outcome {
        Ok(_) => {
            warn!(%instance_id, %status, "instance no longer ready");
            ReadinessError::Regressed {
                instance_id,
                status,
            }
        }
        Err(ReadinessError::Timeout { attempts, .. }) => ReadinessError::Timeout {
            instance_id,
            attempts,
            last_status: status,
        },
        Err(other) => other,
    };
    (instance, Err(revised))
}

/// Returns `true` when a TCP connection to `endpoint` succeeds within
/// `limit`.
pub async fn probe_endpoint(endpoint: &Endpoint, limit: Duration) -> bool {
    let connect = timeout(
        limit,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await;
    matches!(connect, Ok(Ok(_)))
}

fn attempts_within(max_wait: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let attempts = max_wait.as_nanos().div_ceil(interval.as_nanos());
    u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
}
