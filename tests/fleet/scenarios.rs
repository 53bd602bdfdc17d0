//! BDD scenarios for fleet runs.

use rstest_bdd_macros::scenario;

use super::test_helpers::{FleetContext, fleet_context};

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Provision the cheapest eligible offers"
)]
fn scenario_provision_cheapest(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Reject a fleet larger than the eligible offers"
)]
fn scenario_insufficient_offers(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Abort when the SSH key cannot be registered"
)]
fn scenario_credential_failure(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Count rejected creations without aborting"
)]
fn scenario_rejected_creation(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Launch the task on ready instances"
)]
fn scenario_dispatch(fleet_context: FleetContext) {
    let _ = fleet_context;
}
