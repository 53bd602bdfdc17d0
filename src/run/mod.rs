//! Orchestrates one end-to-end fleet run.
//!
//! The run searches offers, selects the cheapest eligible ones, provisions
//! them concurrently, waits for the fleet to become reachable, and
//! optionally dispatches the remote task. Failures that leave no valid
//! partial outcome (search failure, empty selection, credential bootstrap
//! failure) abort the run; everything else is counted in [`RunSummary`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::credential::{CredentialError, CredentialProvider};
use crate::dispatch::{DispatchReport, TaskDispatcher};
use crate::fleet::FleetProvisioner;
use crate::provider::{DeploymentTemplate, OfferFilter, Provider, ProviderError};
use crate::readiness::{FleetReadiness, ReadinessError, ReadinessPoller};
use crate::selection::{SelectionError, SelectionPolicy, select_offers};
use crate::shell::CommandRunner;

/// Errors that abort a fleet run before any instance work is reported.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunError {
    /// Offer search failed.
    #[error("offer search failed: {0}")]
    Search(#[source] ProviderError),
    /// The offer snapshot cannot satisfy the request.
    #[error(transparent)]
    Selection(#[from] SelectionError),
    /// The SSH credential could not be prepared.
    #[error("credential bootstrap failed: {0}")]
    Credential(#[source] CredentialError),
}

/// Parameters of a single run, usually taken from CLI flags.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetRequest {
    /// Number of instances to provision.
    pub count: usize,
    /// Highest acceptable price per hour in USD.
    pub max_price: f64,
    /// Longest time to wait for the fleet to become ready.
    pub max_wait: Duration,
    /// Restrict search to verified hosts.
    pub verified_only: bool,
    /// Dispatch the remote task to ready instances.
    pub dispatch: bool,
}

/// Static settings shared by every run.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetSettings {
    /// Structural search constraints.
    pub filter: OfferFilter,
    /// Accelerator model substrings never rented.
    pub excluded_models: Vec<String>,
    /// Deployment template sent with every creation request.
    pub template: DeploymentTemplate,
    /// Maximum simultaneous creation requests.
    pub max_concurrent_creates: usize,
    /// Minimum spacing between creation requests.
    pub request_spacing: Duration,
    /// Interval between single-instance status lookups.
    pub poll_interval: Duration,
    /// Interval between fleet readiness progress reports.
    pub fleet_check_interval: Duration,
}

/// Counts reported at the end of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Identifier attached to every log event of the run.
    pub run_id: String,
    /// Offers returned by the search.
    pub offers_found: usize,
    /// Offers that passed price and model filtering.
    pub offers_eligible: usize,
    /// Offers chosen for provisioning.
    pub offers_selected: usize,
    /// Instances created.
    pub instances_created: usize,
    /// Creation attempts that failed.
    pub creation_failures: usize,
    /// Instances that became ready.
    pub instances_ready: usize,
    /// Created instances that never became ready.
    pub instances_not_ready: usize,
    /// Why each instance that never became ready was left out.
    pub readiness_failures: Vec<ReadinessError>,
    /// Dispatch results, when the task was dispatched.
    pub dispatch: Option<DispatchReport>,
}

impl RunSummary {
    /// Process exit code for this run: non-zero when no instance became
    /// ready.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.instances_ready == 0 { 1 } else { 0 }
    }
}

#[expect(
    clippy::float_arithmetic,
    reason = "success rate is rendered as a percentage"
)]
fn as_percent(rate: f64) -> f64 {
    rate * 100.0
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FLEET SUMMARY ({}) ===", self.run_id)?;
        writeln!(f, "Offers found: {}", self.offers_found)?;
        writeln!(f, "Offers after filtering: {}", self.offers_eligible)?;
        writeln!(f, "Offers selected: {}", self.offers_selected)?;
        writeln!(
            f,
            "Instances created: {} (failed: {})",
            self.instances_created, self.creation_failures
        )?;
        write!(
            f,
            "Instances ready: {}/{}",
            self.instances_ready, self.instances_created
        )?;
        for failure in &self.readiness_failures {
            write!(f, "\n  not ready: {failure}")?;
        }

        let Some(report) = &self.dispatch else {
            return Ok(());
        };
        let tally = report.tally();
        writeln!(f)?;
        writeln!(f, "=== TASK DEPLOYMENT SUMMARY ===")?;
        writeln!(f, "Total instances: {}", report.total())?;
        writeln!(
            f,
            "Successfully started: {} (confirmed: {}, unconfirmed: {})",
            report.succeeded(),
            tally.launched_confirmed,
            tally.launched_unconfirmed
        )?;
        writeln!(
            f,
            "Failed: {} (connectivity: {}, fetch: {}, launch: {})",
            report.failed(),
            tally.connectivity_failed,
            tally.fetch_failed,
            tally.launch_failed
        )?;
        write!(f, "Success rate: {:.1}%", as_percent(report.success_rate()))
    }
}

/// Executes fleet runs against a provider.
pub struct FleetOrchestrator<P, C, R> {
    provider: Arc<P>,
    provisioner: FleetProvisioner<P, C>,
    poller: ReadinessPoller<P>,
    dispatcher: Option<TaskDispatcher<R>>,
    filter: OfferFilter,
    excluded_models: Vec<String>,
    fleet_check_interval: Duration,
}

impl<P, C, R> fmt::Debug for FleetOrchestrator<P, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetOrchestrator")
            .field("filter", &self.filter)
            .field("excluded_models", &self.excluded_models)
            .field("fleet_check_interval", &self.fleet_check_interval)
            .field("dispatch_enabled", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

impl<P, C, R> FleetOrchestrator<P, C, R>
where
    P: Provider + 'static,
    C: CredentialProvider + 'static,
    R: CommandRunner + 'static,
{
    /// Creates an orchestrator that provisions through `provider` using
    /// `credentials` for the shared SSH key.
    #[must_use]
    pub fn new(provider: Arc<P>, credentials: Arc<C>, settings: FleetSettings) -> Self {
        let FleetSettings {
            filter,
            excluded_models,
            template,
            max_concurrent_creates,
            request_spacing,
            poll_interval,
            fleet_check_interval,
        } = settings;
        Self {
            provisioner: FleetProvisioner::new(
                Arc::clone(&provider),
                credentials,
                template,
                max_concurrent_creates,
                request_spacing,
            ),
            poller: ReadinessPoller::new(Arc::clone(&provider), poll_interval),
            provider,
            dispatcher: None,
            filter,
            excluded_models,
            fleet_check_interval,
        }
    }

    /// Enables task dispatch for requests that ask for it.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: TaskDispatcher<R>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Runs the whole workflow for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when the search fails, when no (or too few)
    /// offers survive selection, or when credential bootstrap fails.
    /// Per-instance failures are reported in the summary instead.
    pub async fn execute(&self, request: &FleetRequest) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("fleet_run", %run_id, count = request.count);
        self.run(request, run_id.to_string()).instrument(span).await
    }

    async fn run(&self, request: &FleetRequest, run_id: String) -> Result<RunSummary, RunError> {
        let filter = OfferFilter {
            verified_only: self.filter.verified_only || request.verified_only,
            ..self.filter.clone()
        };
        info!(verified_only = filter.verified_only, "searching for offers");
        let offers = self
            .provider
            .search_offers(&filter)
            .await
            .map_err(RunError::Search)?;
        info!(found = offers.len(), "offers found");

        let policy = SelectionPolicy {
            max_price: request.max_price,
            excluded_models: self.excluded_models.clone(),
            count: request.count,
        };
        let selection = select_offers(&offers, &policy)?;
        for (position, offer) in selection.candidates.iter().enumerate() {
            info!(
                position = position + 1,
                offer_id = offer.id,
                gpu = %offer.gpu_name,
                price_per_hour = offer.price_per_hour,
                "selected offer"
            );
        }

        let provisioned = self.provisioner.provision(&selection.candidates).await;
        if let Some(err) = provisioned.credential_failure() {
            return Err(RunError::Credential(err.clone()));
        }
        for handle in provisioned.succeeded() {
            info!(instance_id = %handle.id, offer_id = handle.offer_id, "created instance");
        }

        let instances = provisioned.instances();
        let fleet = if instances.is_empty() {
            warn!("no instances were created; skipping readiness wait");
            FleetReadiness::default()
        } else {
            self.poller
                .poll_fleet(instances, request.max_wait, self.fleet_check_interval)
                .await
        };
        for ready in &fleet.ready {
            info!(instance_id = %ready.id(), endpoint = %ready.endpoint, "ready instance");
        }
        for pending in &fleet.not_ready {
            warn!(
                instance_id = %pending.instance.id(),
                status = %pending.instance.status(),
                error = %pending.error,
                "instance not ready"
            );
        }

        let dispatch = match (&self.dispatcher, request.dispatch) {
            (Some(dispatcher), true) if !fleet.ready.is_empty() => {
                Some(dispatcher.dispatch(&fleet.ready).await)
            }
            (None, true) => {
                warn!("task dispatch requested but no dispatcher is configured");
                None
            }
            (_, true) => {
                warn!("no ready instances to dispatch to");
                None
            }
            (_, false) => None,
        };

        Ok(RunSummary {
            run_id,
            offers_found: offers.len(),
            offers_eligible: selection.eligible,
            offers_selected: selection.candidates.len(),
            instances_created: provisioned.success_count(),
            creation_failures: provisioned.failure_count(),
            instances_ready: fleet.ready.len(),
            instances_not_ready: fleet.not_ready.len(),
            readiness_failures: fleet
                .not_ready
                .into_iter()
                .map(|pending| pending.error)
                .collect(),
            dispatch,
        })
    }
}
