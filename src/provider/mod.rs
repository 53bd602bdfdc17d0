//! Provider abstraction for renting compute instances from a priced
//! marketplace.
//!
//! The trait mirrors the control-plane calls the fleet workflow needs:
//! offer search, instance creation, status lookup, and credential
//! registration. Implementations decode provider payloads into the typed
//! values defined in [`types`] so raw response text never travels past this
//! boundary.

use std::future::Future;
use std::pin::Pin;

mod error;
mod types;

pub use error::ProviderError;
pub use types::{
    DeploymentTemplate, Endpoint, Instance, InstanceHandle, InstanceId, InstanceStatus, Offer,
    OfferFilter, StatusReport,
};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Control-plane operations implemented by a marketplace client.
pub trait Provider: Send + Sync {
    /// Searches rentable offers matching `filter`, cheapest first.
    ///
    /// Returns at most [`OfferFilter::limit`] offers.
    fn search_offers<'a>(&'a self, filter: &'a OfferFilter) -> ProviderFuture<'a, Vec<Offer>>;

    /// Rents `offer` using the deployment `template` and returns the
    /// provider-assigned instance identifier.
    ///
    /// Creation is not idempotent: every successful call rents a new
    /// instance.
    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        template: &'a DeploymentTemplate,
    ) -> ProviderFuture<'a, InstanceId>;

    /// Fetches the current lifecycle status of an instance. The endpoint is
    /// only populated once the instance reports [`InstanceStatus::Running`].
    fn instance_status(&self, id: InstanceId) -> ProviderFuture<'_, StatusReport>;

    /// Registers `public_key` on the provider account. Registering the same
    /// key twice is harmless.
    fn register_public_key<'a>(&'a self, public_key: &'a str) -> ProviderFuture<'a, ()>;
}
