//! BDD step definitions for fleet runs.

use std::sync::Arc;

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use vastfleet::test_support::{FixedCredential, running};
use vastfleet::{
    CredentialError, FleetOrchestrator, FleetRequest, InstanceId, ProviderError, RunError,
    RunSummary, SelectionError, TaskDispatcher, TaskOutcome,
};

use super::test_helpers::{FleetContext, TICK, four_offers, settings, ssh_options, task_plan};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid step argument: {0}")]
    Argument(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a marketplace with four offers")]
fn marketplace_with_offers(fleet_context: FleetContext) -> FleetContext {
    four_offers(&fleet_context.provider);
    fleet_context
}

#[given("instance \"{id}\" becomes reachable at \"{host}\"")]
fn instance_reachable(
    fleet_context: FleetContext,
    id: u64,
    host: String,
) -> FleetContext {
    fleet_context
        .provider
        .push_statuses(InstanceId(id), [Ok(running(host.trim(), 22))]);
    fleet_context
}

#[given("the SSH key cannot be registered")]
fn key_registration_fails(mut fleet_context: FleetContext) -> FleetContext {
    fleet_context.credential_error = Some(CredentialError::Registration {
        api: String::from("403 forbidden"),
        cli: String::from("vastai: command not found"),
    });
    fleet_context
}

#[given("the provider rejects offer \"{offer_id}\"")]
fn provider_rejects_offer(fleet_context: FleetContext, offer_id: u64) -> FleetContext {
    fleet_context.provider.set_create_outcome(
        offer_id,
        Err(ProviderError::Rejected {
            operation: String::from("create_instance"),
            status: Some(400),
            message: String::from("offer no longer available"),
        }),
    );
    fleet_context
}

#[given("the remote task on \"{host}\" starts with pid \"{pid}\"")]
fn remote_task_starts(fleet_context: FleetContext, host: String, pid: u32) -> FleetContext {
    let target = format!("root@{}", host.trim());
    let pid_line = pid.to_string();
    for stdout in ["ssh connection ok", "", pid_line.as_str(), pid_line.as_str()] {
        fleet_context
            .runner
            .respond_to(&target, Some(0), stdout, "");
    }
    fleet_context
}

#[when("I request a fleet of {count:u32} instances under \"{price}\" per hour")]
fn request_fleet(
    fleet_context: FleetContext,
    count: u32,
    price: String,
) -> Result<FleetContext, StepError> {
    execute(fleet_context, count, &price, false)
}

#[when("I request a task fleet of {count:u32} instances under \"{price}\" per hour")]
fn request_task_fleet(
    fleet_context: FleetContext,
    count: u32,
    price: String,
) -> Result<FleetContext, StepError> {
    execute(fleet_context, count, &price, true)
}

fn execute(
    fleet_context: FleetContext,
    count: u32,
    price: &str,
    dispatch: bool,
) -> Result<FleetContext, StepError> {
    let max_price: f64 = price
        .trim()
        .parse()
        .map_err(|err| StepError::Argument(format!("price {price:?}: {err}")))?;
    let count = usize::try_from(count).map_err(|err| StepError::Argument(err.to_string()))?;
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;

    let credential = fleet_context
        .credential_error
        .clone()
        .map_or_else(FixedCredential::ready, FixedCredential::failing);
    let orchestrator = FleetOrchestrator::new(
        Arc::clone(&fleet_context.provider),
        Arc::new(credential),
        settings(),
    )
    .with_dispatcher(TaskDispatcher::new(
        Arc::clone(&fleet_context.runner),
        ssh_options(),
        task_plan(),
    ));
    let request = FleetRequest {
        count,
        max_price,
        max_wait: TICK * 5,
        verified_only: false,
        dispatch,
    };

    let outcome = runtime.block_on(async move { orchestrator.execute(&request).await });
    Ok(FleetContext {
        outcome: Some(outcome),
        ..fleet_context
    })
}

fn summary(fleet_context: &FleetContext) -> Result<&RunSummary, StepError> {
    match fleet_context.outcome.as_ref() {
        Some(Ok(summary)) => Ok(summary),
        Some(Err(err)) => Err(StepError::Assertion(format!(
            "expected a summary, got failure: {err}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn failure(fleet_context: &FleetContext) -> Result<&RunError, StepError> {
    match fleet_context.outcome.as_ref() {
        Some(Err(err)) => Ok(err),
        Some(Ok(summary)) => Err(StepError::Assertion(format!(
            "expected failure, got summary: {summary:?}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn expect_count(label: &str, actual: usize, expected: u32) -> Result<(), StepError> {
    if u32::try_from(actual).is_ok_and(|value| value == expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} {label}, got {actual}"
        )))
    }
}

#[then("the run creates {count:u32} instances")]
fn run_creates(fleet_context: &FleetContext, count: u32) -> Result<(), StepError> {
    expect_count("created instances", summary(fleet_context)?.instances_created, count)
}

#[then("the run reports {count:u32} ready instance")]
fn run_reports_ready(fleet_context: &FleetContext, count: u32) -> Result<(), StepError> {
    expect_count("ready instances", summary(fleet_context)?.instances_ready, count)
}

#[then("the run reports {count:u32} creation failure")]
fn run_reports_failures(fleet_context: &FleetContext, count: u32) -> Result<(), StepError> {
    expect_count(
        "creation failures",
        summary(fleet_context)?.creation_failures,
        count,
    )
}

#[then("the run exit code is {code:i32}")]
fn run_exit_code(fleet_context: &FleetContext, code: i32) -> Result<(), StepError> {
    let actual = summary(fleet_context)?.exit_code();
    if actual == code {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected exit code {code}, got {actual}"
        )))
    }
}

#[then("the run fails because too few offers qualify")]
fn run_fails_insufficient(fleet_context: &FleetContext) -> Result<(), StepError> {
    match failure(fleet_context)? {
        RunError::Selection(SelectionError::InsufficientOffers { .. }) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected insufficient offers, got: {other}"
        ))),
    }
}

#[then("the run fails with a credential error")]
fn run_fails_credential(fleet_context: &FleetContext) -> Result<(), StepError> {
    match failure(fleet_context)? {
        RunError::Credential(_) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected credential failure, got: {other}"
        ))),
    }
}

#[then("no instances are created")]
fn no_instances_created(fleet_context: &FleetContext) -> Result<(), StepError> {
    let created = fleet_context.provider.calls().create_offer_ids;
    if created.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no creation calls, got offers {created:?}"
        )))
    }
}

#[then("the task is confirmed on {count:u32} instance")]
fn task_confirmed(fleet_context: &FleetContext, count: u32) -> Result<(), StepError> {
    let report = summary(fleet_context)?
        .dispatch
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing dispatch report")))?;
    let confirmed = report
        .records
        .iter()
        .filter(|record| matches!(record.outcome, TaskOutcome::LaunchedConfirmed { .. }))
        .count();
    expect_count("confirmed launches", confirmed, count)
}

#[then("the summary reports a success rate of \"{rate}\"")]
fn summary_success_rate(fleet_context: &FleetContext, rate: String) -> Result<(), StepError> {
    let rendered = summary(fleet_context)?.to_string();
    let expected = format!("Success rate: {}", rate.trim());
    if rendered.contains(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?} in summary:\n{rendered}"
        )))
    }
}
