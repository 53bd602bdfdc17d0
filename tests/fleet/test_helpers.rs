//! Shared fixtures for fleet BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use vastfleet::dispatch::{StageTimeouts, TaskPlan};
use vastfleet::test_support::{ScriptedProvider, ScriptedRunner, offer};
use vastfleet::{
    CredentialError, DeploymentTemplate, FleetSettings, OfferFilter, RunError, RunSummary,
    SshOptions,
};

pub const TICK: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct FleetContext {
    pub provider: Arc<ScriptedProvider>,
    pub runner: Arc<ScriptedRunner>,
    pub credential_error: Option<CredentialError>,
    pub outcome: Option<Result<RunSummary, RunError>>,
}

#[fixture]
pub fn fleet_context() -> FleetContext {
    FleetContext {
        provider: Arc::new(ScriptedProvider::new()),
        runner: Arc::new(ScriptedRunner::new()),
        credential_error: None,
        outcome: None,
    }
}

pub fn four_offers(provider: &ScriptedProvider) {
    provider.set_offers(vec![
        offer(1, "RTX 3060", 0.20),
        offer(2, "RTX 4090", 0.15),
        offer(3, "RTX A4000", 0.30),
        offer(4, "RTX 3070", 0.70),
    ]);
}

pub fn settings() -> FleetSettings {
    FleetSettings {
        filter: OfferFilter::default(),
        excluded_models: vec![String::from("4090")],
        template: DeploymentTemplate::default(),
        max_concurrent_creates: 2,
        request_spacing: Duration::ZERO,
        poll_interval: TICK,
        fleet_check_interval: TICK,
    }
}

pub fn task_plan() -> TaskPlan {
    TaskPlan {
        artifact_base_url: String::from("https://artifacts.example.org"),
        artifacts: vec![String::from("start.sh")],
        launch_command: String::from("./start.sh"),
        process_pattern: String::from("start.sh"),
        log_file: String::from("task_output.log"),
        timeouts: StageTimeouts::default(),
        confirm_delay: Duration::ZERO,
    }
}

pub fn ssh_options() -> SshOptions {
    SshOptions {
        ssh_bin: String::from("ssh"),
        user: String::from("root"),
        identity_file: None,
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::new(),
        connect_timeout: Duration::from_secs(10),
    }
}
