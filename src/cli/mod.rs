//! Command-line interface definitions for the `vastfleet` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `vastfleet` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vastfleet",
    version,
    about = "Rent a fleet of GPU instances, wait for SSH, and launch a remote task"
)]
pub(crate) struct Cli {
    /// Number of instances to provision.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) count: u32,
    /// Highest acceptable price per hour in USD.
    #[arg(long, value_name = "USD", default_value_t = 0.5, value_parser = parse_price)]
    pub(crate) max_price: f64,
    /// Minutes to wait for instances to become ready.
    #[arg(long, alias = "wait", value_name = "MINUTES", default_value_t = 5)]
    pub(crate) wait_minutes: u64,
    /// Launch the remote task on every ready instance.
    #[arg(long, alias = "start-tests")]
    pub(crate) dispatch: bool,
    /// Only rent offers from verified hosts.
    #[arg(long)]
    pub(crate) verified: bool,
}

/// Parses a strictly positive, finite price.
pub(crate) fn parse_price(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|err| format!("{raw:?} is not a price: {err}"))?;
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(String::from("price must be a positive number"))
    }
}
