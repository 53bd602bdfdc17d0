//! Binary entry point for the `vastfleet` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use vastfleet::config::{ConfigError, FleetConfig, TaskConfig, VastConfig};
use vastfleet::{
    CredentialBootstrapper, FleetOrchestrator, FleetRequest, FleetSettings, ProcessCommandRunner,
    ProviderError, RunError, RunSummary, TaskDispatcher, VastClient,
};

mod cli;

use cli::Cli;

const DEFAULT_LOG_FILTER: &str = "vastfleet=info";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("fleet run failed: {0}")]
    Run(#[from] RunError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn fleet_request(cli: &Cli) -> Result<FleetRequest, CliError> {
    let count = usize::try_from(cli.count)
        .map_err(|err| CliError::InvalidArgument(format!("--count {}: {err}", cli.count)))?;
    Ok(FleetRequest {
        count,
        max_price: cli.max_price,
        max_wait: Duration::from_secs(cli.wait_minutes.saturating_mul(60)),
        verified_only: cli.verified,
        dispatch: cli.dispatch,
    })
}

async fn run(cli: &Cli) -> Result<i32, CliError> {
    let request = fleet_request(cli)?;

    let vast = VastConfig::load_without_cli_args()?;
    vast.validate()?;
    let fleet = FleetConfig::load_without_cli_args()?;
    fleet.validate()?;
    let task = TaskConfig::load_without_cli_args()?;
    task.validate(request.dispatch)?;

    let provider = Arc::new(VastClient::new(
        vast.api_url.trim(),
        vast.api_key.trim(),
        vast.request_timeout(),
    )?);
    let runner = Arc::new(ProcessCommandRunner);
    let key_store = fleet.key_store()?;
    let identity_file = key_store.private_key().to_owned();
    let credentials = Arc::new(CredentialBootstrapper::new(
        Arc::clone(&provider),
        Arc::clone(&runner),
        key_store,
        vast.cli_bin.trim(),
    ));

    let settings = FleetSettings {
        filter: vast.offer_filter(false),
        excluded_models: fleet.excluded_models(),
        template: vast.deployment_template()?,
        max_concurrent_creates: fleet.max_concurrent_creates,
        request_spacing: fleet.request_spacing(),
        poll_interval: fleet.poll_interval(),
        fleet_check_interval: fleet.fleet_check_interval(),
    };
    let mut orchestrator = FleetOrchestrator::new(provider, credentials, settings);
    if request.dispatch {
        orchestrator = orchestrator.with_dispatcher(TaskDispatcher::new(
            runner,
            task.ssh_options(Some(identity_file)),
            task.task_plan(),
        ));
    }

    let summary = orchestrator.execute(&request).await?;
    write_summary(io::stdout(), &summary);
    Ok(summary.exit_code())
}

fn write_summary(mut target: impl Write, summary: &RunSummary) {
    writeln!(target, "{summary}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
