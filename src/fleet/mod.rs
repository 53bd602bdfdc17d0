//! Concurrent, rate-limited creation of a fleet of instances.
//!
//! Each selected offer gets its own worker. Workers share a slot pool that
//! caps simultaneous creation requests and a pacer that spaces request
//! starts in wall-clock time. Failures are recorded per offer and never
//! abort siblings; the provisioner returns once every offer has exactly
//! one record.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::credential::{CredentialError, CredentialProvider};
use crate::provider::{DeploymentTemplate, Instance, InstanceHandle, Offer, Provider, ProviderError};

/// Default minimum spacing between creation requests.
pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(250);

/// Enforces a minimum interval between request starts across all workers.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    next_start: AsyncMutex<Option<Instant>>,
}

impl RequestPacer {
    /// Creates a pacer that lets one request start every `spacing`.
    #[must_use]
    pub const fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_start: AsyncMutex::const_new(None),
        }
    }

    /// Waits until the caller may start its request. Waiters are served in
    /// turn; only the waiting worker is suspended.
    pub async fn wait_turn(&self) {
        let mut next_start = self.next_start.lock().await;
        if let Some(at) = *next_start {
            sleep_until(at).await;
        }
        *next_start = Some(Instant::now() + self.spacing);
    }
}

/// Errors recorded for a single offer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The shared credential bootstrap failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The provider refused or could not be reached.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The worker ended without recording an outcome.
    #[error("provisioning worker aborted: {0}")]
    WorkerAborted(String),
}

/// Outcome of provisioning one offer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionRecord {
    /// Position of the offer in the candidate list.
    pub index: usize,
    /// Offer that was attempted.
    pub offer: Offer,
    /// Created instance or the reason creation failed.
    pub outcome: Result<InstanceHandle, ProvisionError>,
}

/// All provisioning records for one fleet, ordered by candidate index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisioningResult {
    /// One record per attempted offer.
    pub records: Vec<ProvisionRecord>,
}

impl ProvisioningResult {
    /// Number of attempted offers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Handles of successfully created instances.
    pub fn succeeded(&self) -> impl Iterator<Item = &InstanceHandle> {
        self.records
            .iter()
            .filter_map(|record| record.outcome.as_ref().ok())
    }

    /// Offers whose creation failed, with the reason.
    pub fn failed(&self) -> impl Iterator<Item = (&Offer, &ProvisionError)> {
        self.records
            .iter()
            .filter_map(|record| record.outcome.as_ref().err().map(|err| (&record.offer, err)))
    }

    /// Number of created instances.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    /// Number of failed attempts.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    /// Returns the credential error when bootstrap failed for this fleet.
    #[must_use]
    pub fn credential_failure(&self) -> Option<&CredentialError> {
        self.failed().find_map(|(_, err)| match err {
            ProvisionError::Credential(credential) => Some(credential),
            ProvisionError::Provider(_) | ProvisionError::WorkerAborted(_) => None,
        })
    }

    /// Wraps the created handles as instances ready for polling.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.succeeded().cloned().map(Instance::new).collect()
    }
}

/// Drives concurrent creation of instances for a list of offers.
pub struct FleetProvisioner<P, C> {
    provider: Arc<P>,
    credentials: Arc<C>,
    template: Arc<DeploymentTemplate>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    pacer: Arc<RequestPacer>,
}

impl<P, C> std::fmt::Debug for FleetProvisioner<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetProvisioner")
            .field("template", &self.template)
            .field("max_concurrent", &self.max_concurrent)
            .field("pacer", &self.pacer)
            .finish_non_exhaustive()
    }
}

impl<P, C> FleetProvisioner<P, C>
where
    P: Provider + 'static,
    C: CredentialProvider + 'static,
{
    /// Creates a provisioner allowing `max_concurrent` in-flight creation
    /// requests (at least one) started no closer than `spacing` apart.
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        credentials: Arc<C>,
        template: DeploymentTemplate,
        max_concurrent: usize,
        spacing: Duration,
    ) -> Self {
        let cap = max_concurrent.max(1);
        Self {
            provider,
            credentials,
            template: Arc::new(template),
            slots: Arc::new(Semaphore::new(cap)),
            max_concurrent: cap,
            pacer: Arc::new(RequestPacer::new(spacing)),
        }
    }

    /// Attempts to create one instance per offer and waits for every
    /// attempt to finish.
    ///
    /// The result always holds exactly one record per offer.
    pub async fn provision(&self, offers: &[Offer]) -> ProvisioningResult {
        info!(
            count = offers.len(),
            max_concurrent = self.max_concurrent,
            "creating instances with rate limiting"
        );

        let records = Arc::new(Mutex::new(Vec::with_capacity(offers.len())));
        let mut workers = JoinSet::new();
        for (index, offer) in offers.iter().cloned().enumerate() {
            let worker = Worker {
                provider: Arc::clone(&self.provider),
                credentials: Arc::clone(&self.credentials),
                template: Arc::clone(&self.template),
                slots: Arc::clone(&self.slots),
                pacer: Arc::clone(&self.pacer),
                records: Arc::clone(&records),
            };
            workers.spawn(worker.run(index, offer));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "provisioning worker terminated abnormally");
            }
        }

        let mut collected = std::mem::take(
            &mut *records.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let recorded: BTreeSet<usize> = collected.iter().map(|record| record.index).collect();
        for (index, offer) in offers.iter().enumerate() {
            if !recorded.contains(&index) {
                collected.push(ProvisionRecord {
                    index,
                    offer: offer.clone(),
                    outcome: Err(ProvisionError::WorkerAborted(String::from(
                        "worker ended before recording an outcome",
                    ))),
                });
            }
        }
        collected.sort_by_key(|record| record.index);

        let result = ProvisioningResult { records: collected };
        info!(
            created = result.success_count(),
            failed = result.failure_count(),
            "all creation attempts finished"
        );
        result
    }
}

struct Worker<P, C> {
    provider: Arc<P>,
    credentials: Arc<C>,
    template: Arc<DeploymentTemplate>,
    slots: Arc<Semaphore>,
    pacer: Arc<RequestPacer>,
    records: Arc<Mutex<Vec<ProvisionRecord>>>,
}

impl<P, C> Worker<P, C>
where
    P: Provider,
    C: CredentialProvider,
{
    async fn run(self, index: usize, offer: Offer) {
        let outcome = self.attempt(index, &offer).await;
        match &outcome {
            Ok(handle) => info!(
                slot = index + 1,
                instance_id = %handle.id,
                offer_id = offer.id,
                "instance created"
            ),
            Err(err) => warn!(
                slot = index + 1,
                offer_id = offer.id,
                error = %err,
                "failed to create instance"
            ),
        }

        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ProvisionRecord {
                index,
                offer,
                outcome,
            });
    }

    async fn attempt(&self, index: usize, offer: &Offer) -> Result<InstanceHandle, ProvisionError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|err| ProvisionError::WorkerAborted(err.to_string()))?;
        self.pacer.wait_turn().await;

        info!(
            slot = index + 1,
            offer_id = offer.id,
            gpu = %offer.gpu_name,
            num_gpus = offer.num_gpus,
            disk_gb = offer.disk_space_gb,
            price_per_hour = offer.price_per_hour,
            min_bid = ?offer.min_bid,
            verification = ?offer.verification,
            "creating instance from offer"
        );

        self.credentials.credential().await?;
        debug!(offer_id = offer.id, "credential ready");

        let id = self.provider.create_instance(offer, &self.template).await?;
        Ok(InstanceHandle {
            id,
            offer_id: offer.id,
            created_at: SystemTime::now(),
        })
    }
}
