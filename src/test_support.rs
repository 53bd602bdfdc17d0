//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here are `Send + Sync` so they can be driven through the
//! concurrent provisioning and dispatch paths.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::credential::{Credential, CredentialError, CredentialFuture, CredentialProvider};
use crate::provider::{
    DeploymentTemplate, Endpoint, InstanceId, InstanceStatus, Offer, OfferFilter, Provider,
    ProviderError, ProviderFuture, StatusReport,
};
use crate::shell::{CommandOutput, CommandRunner, RunnerFuture, ShellError};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a rentable offer with the given identifier, model, and price.
#[must_use]
pub fn offer(id: u64, gpu_name: &str, price_per_hour: f64) -> Offer {
    Offer {
        id,
        gpu_name: gpu_name.to_owned(),
        num_gpus: 1,
        disk_space_gb: 64.0,
        price_per_hour,
        rentable: true,
        min_bid: Some(price_per_hour),
        verification: Some(String::from("verified")),
    }
}

/// Builds a running status report with an endpoint.
#[must_use]
pub fn running(host: &str, port: u16) -> StatusReport {
    StatusReport {
        status: InstanceStatus::Running,
        endpoint: Some(Endpoint {
            host: host.to_owned(),
            port,
        }),
    }
}

/// Builds a status report without an endpoint.
#[must_use]
pub const fn pending(status: InstanceStatus) -> StatusReport {
    StatusReport {
        status,
        endpoint: None,
    }
}

/// Credential provider that returns a fixed outcome and counts requests.
#[derive(Debug)]
pub struct FixedCredential {
    outcome: Result<Credential, CredentialError>,
    requests: Mutex<usize>,
}

impl FixedCredential {
    /// Always yields a credential for `/tmp/fleet_ed25519`.
    #[must_use]
    pub fn ready() -> Self {
        Self::with_outcome(Ok(Credential {
            private_key: camino::Utf8PathBuf::from("/tmp/fleet_ed25519"),
            public_key: String::from("ssh-ed25519 AAAATEST fleet"),
        }))
    }

    /// Always yields `error`.
    #[must_use]
    pub fn failing(error: CredentialError) -> Self {
        Self::with_outcome(Err(error))
    }

    fn with_outcome(outcome: Result<Credential, CredentialError>) -> Self {
        Self {
            outcome,
            requests: Mutex::new(0),
        }
    }

    /// Number of times the credential was requested.
    #[must_use]
    pub fn requests(&self) -> usize {
        *locked(&self.requests)
    }
}

impl CredentialProvider for FixedCredential {
    fn credential(&self) -> CredentialFuture<'_> {
        Box::pin(async move {
            *locked(&self.requests) += 1;
            self.outcome.clone()
        })
    }
}

/// Scripted provider that records calls and replays seeded outcomes.
///
/// Creation succeeds by default with instance id `offer.id + 1000`.
/// Status queues repeat their final entry once drained.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    offers: Mutex<Option<Result<Vec<Offer>, ProviderError>>>,
    create_outcomes: Mutex<HashMap<u64, Result<InstanceId, ProviderError>>>,
    create_delay: Mutex<Duration>,
    status_delay: Mutex<Duration>,
    statuses: Mutex<HashMap<InstanceId, VecDeque<Result<StatusReport, ProviderError>>>>,
    register_outcome: Mutex<Option<ProviderError>>,
    calls: Mutex<CallLog>,
}

/// Calls observed by a [`ScriptedProvider`].
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    /// Offer ids passed to `create_instance`, in call order.
    pub create_offer_ids: Vec<u64>,
    /// Start times of `create_instance` calls.
    pub create_started: Vec<Instant>,
    /// Number of creations running right now.
    pub creates_in_flight: usize,
    /// Highest number of overlapping creations observed.
    pub max_creates_in_flight: usize,
    /// Number of `instance_status` calls per instance.
    pub status_calls: HashMap<InstanceId, usize>,
    /// Number of `register_public_key` calls.
    pub register_calls: usize,
    /// Number of `search_offers` calls.
    pub search_calls: usize,
}

impl ScriptedProvider {
    /// Creates a provider with no scripted outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the offers returned by `search_offers`.
    pub fn set_offers(&self, offers: Vec<Offer>) {
        *locked(&self.offers) = Some(Ok(offers));
    }

    /// Makes `search_offers` fail.
    pub fn fail_search(&self, error: ProviderError) {
        *locked(&self.offers) = Some(Err(error));
    }

    /// Scripts the creation outcome for `offer_id`.
    pub fn set_create_outcome(&self, offer_id: u64, outcome: Result<InstanceId, ProviderError>) {
        locked(&self.create_outcomes).insert(offer_id, outcome);
    }

    /// Makes each creation call take `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        *locked(&self.create_delay) = delay;
    }

    /// Makes each status lookup take `delay`.
    pub fn set_status_delay(&self, delay: Duration) {
        *locked(&self.status_delay) = delay;
    }

    /// Appends status observations for `id`.
    pub fn push_statuses(
        &self,
        id: InstanceId,
        statuses: impl IntoIterator<Item = Result<StatusReport, ProviderError>>,
    ) {
        locked(&self.statuses)
            .entry(id)
            .or_default()
            .extend(statuses);
    }

    /// Makes `register_public_key` fail.
    pub fn fail_registration(&self, error: ProviderError) {
        *locked(&self.register_outcome) = Some(error);
    }

    /// Returns a snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> CallLog {
        locked(&self.calls).clone()
    }

    /// Returns how many status lookups were made for `id`.
    #[must_use]
    pub fn status_calls(&self, id: InstanceId) -> usize {
        locked(&self.calls)
            .status_calls
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    fn next_status(&self, id: InstanceId) -> Result<StatusReport, ProviderError> {
        let mut statuses = locked(&self.statuses);
        let Some(queue) = statuses.get_mut(&id) else {
            return Ok(pending(InstanceStatus::Created));
        };
        if queue.len() > 1 {
            return queue
                .pop_front()
                .unwrap_or_else(|| Ok(pending(InstanceStatus::Unknown)));
        }
        queue
            .front()
            .cloned()
            .unwrap_or_else(|| Ok(pending(InstanceStatus::Created)))
    }
}

impl Provider for ScriptedProvider {
    fn search_offers<'a>(&'a self, filter: &'a OfferFilter) -> ProviderFuture<'a, Vec<Offer>> {
        Box::pin(async move {
            locked(&self.calls).search_calls += 1;
            let limit = usize::try_from(filter.limit).unwrap_or(usize::MAX);
            let scripted = locked(&self.offers).clone();
            match scripted {
                Some(Ok(offers)) => Ok(offers.into_iter().take(limit).collect()),
                Some(Err(err)) => Err(err),
                None => Ok(Vec::new()),
            }
        })
    }

    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        _template: &'a DeploymentTemplate,
    ) -> ProviderFuture<'a, InstanceId> {
        Box::pin(async move {
            {
                let mut calls = locked(&self.calls);
                calls.create_offer_ids.push(offer.id);
                calls.create_started.push(Instant::now());
                calls.creates_in_flight += 1;
                calls.max_creates_in_flight =
                    calls.max_creates_in_flight.max(calls.creates_in_flight);
            }

            let delay = *locked(&self.create_delay);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            locked(&self.calls).creates_in_flight -= 1;
            locked(&self.create_outcomes)
                .get(&offer.id)
                .cloned()
                .unwrap_or(Ok(InstanceId(offer.id + 1000)))
        })
    }

    fn instance_status(&self, id: InstanceId) -> ProviderFuture<'_, StatusReport> {
        Box::pin(async move {
            *locked(&self.calls).status_calls.entry(id).or_default() += 1;
            let delay = *locked(&self.status_delay);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.next_status(id)
        })
    }

    fn register_public_key<'a>(&'a self, _public_key: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            locked(&self.calls).register_calls += 1;
            locked(&self.register_outcome).clone().map_or(Ok(()), Err)
        })
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Clone, Debug)]
enum Scripted {
    Output(CommandOutput),
    Error(ShellError),
    Stall,
}

/// Scripted command runner.
///
/// Responses are matched by a needle: the first rule whose needle appears
/// in the rendered command line answers, in FIFO order. Commands matching
/// no rule draw from the default queue.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    default_queue: Mutex<VecDeque<Scripted>>,
    invocations: Mutex<Vec<CommandInvocation>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Queues a successful, empty response on the default queue.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Queues an explicit response on the default queue.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.default_queue).push_back(Scripted::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Queues an explicit response for commands containing `needle`.
    pub fn respond_to(
        &self,
        needle: &str,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push_rule(
            needle,
            Scripted::Output(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            }),
        );
    }

    /// Queues a spawn failure for commands containing `needle`.
    pub fn fail_to_spawn(&self, needle: &str) {
        self.push_rule(
            needle,
            Scripted::Error(ShellError::Spawn {
                program: needle.to_owned(),
                message: String::from("simulated spawn failure"),
            }),
        );
    }

    /// Makes the next command containing `needle` never finish.
    pub fn stall_on(&self, needle: &str) {
        self.push_rule(needle, Scripted::Stall);
    }

    fn push_rule(&self, needle: &str, response: Scripted) {
        let mut rules = locked(&self.rules);
        if let Some((_, queue)) = rules.iter_mut().find(|(existing, _)| existing == needle) {
            queue.push_back(response);
        } else {
            rules.push((needle.to_owned(), VecDeque::from([response])));
        }
    }

    fn next_response(&self, invocation: &CommandInvocation) -> Option<Scripted> {
        let rendered = invocation.command_string();
        let mut rules = locked(&self.rules);
        if let Some((_, queue)) = rules
            .iter_mut()
            .find(|(needle, queue)| !queue.is_empty() && rendered.contains(needle.as_str()))
        {
            return queue.pop_front();
        }
        drop(rules);
        locked(&self.default_queue).pop_front()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let invocation = CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            };
            let response = self.next_response(&invocation);
            locked(&self.invocations).push(invocation);

            match response {
                Some(Scripted::Output(output)) => Ok(output),
                Some(Scripted::Error(err)) => Err(err),
                Some(Scripted::Stall) => {
                    std::future::pending::<()>().await;
                    Err(ShellError::Spawn {
                        program: program.to_owned(),
                        message: String::from("stalled command resumed"),
                    })
                }
                None => Err(ShellError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}
