//! HTTP client for the Vast marketplace control plane.

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use tracing::debug;

use crate::provider::{
    DeploymentTemplate, InstanceId, Offer, OfferFilter, Provider, ProviderError, ProviderFuture,
    StatusReport,
};

mod wire;

pub use wire::{creation_body, decode_created, decode_offers, decode_status, search_query};

/// Default API base URL.
pub const DEFAULT_API_URL: &str = "https://console.vast.ai/api/v0";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SEARCH_ORDER: &str = "dph_total";
const SEARCH_TYPE: &str = "on-demand";

/// [`Provider`] implementation backed by the marketplace REST API.
#[derive(Clone)]
pub struct VastClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for VastClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VastClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl VastClient {
    /// Builds a client authenticating with `api_key` against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] when the HTTP client cannot be
    /// constructed (for example when no TLS backend is available).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::unavailable("client", err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<String, ProviderError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| ProviderError::unavailable(operation, err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::unavailable(operation, err.to_string()))?;
        debug!(operation, status = status.as_u16(), "provider responded");

        if !status.is_success() {
            let message = match body.trim() {
                "" => status
                    .canonical_reason()
                    .unwrap_or("no response body")
                    .to_owned(),
                text => text.to_owned(),
            };
            return Err(ProviderError::Rejected {
                operation: operation.to_owned(),
                status: Some(status.as_u16()),
                message,
            });
        }
        Ok(body)
    }
}

impl Provider for VastClient {
    fn search_offers<'a>(&'a self, filter: &'a OfferFilter) -> ProviderFuture<'a, Vec<Offer>> {
        Box::pin(async move {
            let query = search_query(filter).to_string();
            let limit = filter.limit.to_string();
            let request = self.http.get(self.url("bundles")).query(&[
                ("q", query.as_str()),
                ("order", SEARCH_ORDER),
                ("type", SEARCH_TYPE),
                ("limit", limit.as_str()),
            ]);
            let body = self.send("search_offers", request).await?;
            let mut offers = decode_offers(&body)?;
            offers.truncate(usize::try_from(filter.limit).unwrap_or(usize::MAX));
            Ok(offers)
        })
    }

    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        template: &'a DeploymentTemplate,
    ) -> ProviderFuture<'a, InstanceId> {
        Box::pin(async move {
            let request = self
                .http
                .put(self.url(&format!("asks/{}/", offer.id)))
                .json(&creation_body(offer, template));
            let body = self.send("create_instance", request).await?;
            decode_created(&body)
        })
    }

    fn instance_status(&self, id: InstanceId) -> ProviderFuture<'_, StatusReport> {
        Box::pin(async move {
            let request = self.http.get(self.url(&format!("instances/{id}/")));
            let body = self.send("instance_status", request).await?;
            decode_status(&body)
        })
    }

    fn register_public_key<'a>(&'a self, public_key: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .http
                .put(self.url("users/current/"))
                .json(&json!({ "ssh_key": public_key }));
            self.send("register_public_key", request).await.map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests;
