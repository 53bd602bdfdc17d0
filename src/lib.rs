//! Core library for the `vastfleet` GPU fleet provisioner.
//!
//! The crate rents a batch of instances from the Vast marketplace: it
//! searches offers, picks the cheapest eligible ones, provisions them
//! concurrently under a rate limit, waits until they accept SSH, and can
//! launch a remote task on every ready instance.

pub mod config;
pub mod credential;
pub mod dispatch;
pub mod fleet;
pub mod provider;
pub mod readiness;
pub mod run;
pub mod selection;
pub mod shell;
pub mod test_support;
pub mod vast;

pub use config::{ConfigError, FleetConfig, TaskConfig, VastConfig};
pub use credential::{
    BootstrapState, Credential, CredentialBootstrapper, CredentialError, CredentialProvider,
    KeyStore,
};
pub use dispatch::{
    DispatchReport, Stage, StageTimeouts, TaskDispatcher, TaskOutcome, TaskPlan, TaskRecord,
};
pub use fleet::{
    FleetProvisioner, ProvisionError, ProvisionRecord, ProvisioningResult, RequestPacer,
};
pub use provider::{
    DeploymentTemplate, Endpoint, Instance, InstanceHandle, InstanceId, InstanceStatus, Offer,
    OfferFilter, Provider, ProviderError, StatusReport,
};
pub use readiness::{FleetReadiness, NotReady, ReadinessError, ReadinessPoller, ReadyInstance};
pub use run::{FleetOrchestrator, FleetRequest, FleetSettings, RunError, RunSummary};
pub use selection::{Selection, SelectionError, SelectionPolicy, select_offers};
pub use shell::{CommandOutput, CommandRunner, ProcessCommandRunner, ShellError, SshOptions};
pub use vast::VastClient;
