//! JSON payloads exchanged with the marketplace API.
//!
//! Decoding is strict about the fields the fleet workflow depends on and
//! lenient about everything else. Any decode failure is reported as a
//! rejected response so raw payload text never leaves this module.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::provider::{
    DeploymentTemplate, Endpoint, InstanceId, InstanceStatus, Offer, OfferFilter, ProviderError,
    StatusReport,
};

const SSH_PORT_KEY: &str = "22/tcp";

#[derive(Debug, Deserialize)]
struct OffersPayload {
    #[serde(default)]
    offers: Vec<WireOffer>,
}

#[derive(Debug, Deserialize)]
struct WireOffer {
    id: u64,
    #[serde(default)]
    gpu_name: String,
    #[serde(default)]
    num_gpus: u32,
    #[serde(default)]
    disk_space: f64,
    dph_total: f64,
    #[serde(default)]
    rentable: bool,
    #[serde(default)]
    min_bid: Option<f64>,
    #[serde(default)]
    verification: Option<String>,
}

impl From<WireOffer> for Offer {
    fn from(wire: WireOffer) -> Self {
        Self {
            id: wire.id,
            gpu_name: wire.gpu_name,
            num_gpus: wire.num_gpus,
            disk_space_gb: wire.disk_space,
            price_per_hour: wire.dph_total,
            rentable: wire.rentable,
            min_bid: wire.min_bid,
            verification: wire.verification,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedPayload {
    #[serde(default)]
    new_contract: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InstancePayload {
    #[serde(default)]
    instances: Option<WireInstance>,
}

#[derive(Debug, Deserialize)]
struct WireInstance {
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(flatten)]
    details: Map<String, Value>,
}

/// Connection fields, decoded only once the instance reports `running`.
#[derive(Debug, Deserialize)]
struct WireEndpoint {
    #[serde(default)]
    ssh_host: Option<String>,
    #[serde(default)]
    ssh_port: Option<u16>,
    #[serde(default)]
    public_ipaddr: Option<String>,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

/// Builds the `q` search parameter for an offer filter.
#[must_use]
pub fn search_query(filter: &OfferFilter) -> Value {
    let mut query = json!({
        "rentable": { "eq": true },
        "disk_space": { "gte": filter.min_disk_gb },
        "gpu_display_active": { "eq": true },
    });
    if filter.verified_only
        && let Some(fields) = query.as_object_mut()
    {
        fields.insert(
            String::from("verification"),
            json!({ "eq": "verified" }),
        );
    }
    query
}

/// Builds the creation request body for renting `offer` with `template`.
#[must_use]
pub fn creation_body(offer: &Offer, template: &DeploymentTemplate) -> Value {
    let mut env = Map::new();
    for port in &template.ports {
        env.insert(format!("-p {port}:{port}"), Value::from("1"));
    }
    for (key, value) in &template.env {
        env.insert(key.clone(), Value::from(value.as_str()));
    }

    let mut body = Map::new();
    if let Some(id) = template.template_id {
        body.insert(String::from("template_id"), Value::from(id));
    }
    if let Some(hash) = &template.template_hash_id {
        body.insert(String::from("template_hash_id"), Value::from(hash.as_str()));
    }
    body.insert(String::from("client_id"), Value::from("me"));
    body.insert(String::from("image"), Value::from(template.image.as_str()));
    body.insert(String::from("env"), Value::Object(env));
    body.insert(String::from("onstart"), Value::from(template.onstart.as_str()));
    body.insert(String::from("runtype"), Value::from(template.runtype.as_str()));
    body.insert(String::from("disk"), Value::from(template.disk_gb));
    body.insert(
        String::from("last_known_min_bid"),
        offer.min_bid.map_or(Value::Null, Value::from),
    );
    body.insert(
        String::from("min_duration"),
        Value::from(template.min_duration_secs),
    );
    Value::Object(body)
}

/// Decodes an offer search response.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] when the body is not a valid offer
/// list.
pub fn decode_offers(body: &str) -> Result<Vec<Offer>, ProviderError> {
    let payload: OffersPayload = serde_json::from_str(body)
        .map_err(|err| ProviderError::malformed("search_offers", err.to_string()))?;
    Ok(payload.offers.into_iter().map(Offer::from).collect())
}

/// Decodes a creation response into the new instance identifier.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] when the body is not JSON or lacks
/// the `new_contract` field.
pub fn decode_created(body: &str) -> Result<InstanceId, ProviderError> {
    let payload: CreatedPayload = serde_json::from_str(body)
        .map_err(|err| ProviderError::malformed("create_instance", err.to_string()))?;
    payload.new_contract.map(InstanceId).ok_or_else(|| {
        ProviderError::malformed(
            "create_instance",
            format!("response lacks new_contract: {}", body.trim()),
        )
    })
}

/// Decodes an instance lookup into a status report.
///
/// The endpoint is resolved only for running instances: the proxy
/// `ssh_host`/`ssh_port` pair wins, otherwise the public address with the
/// host port bound to `22/tcp` is used.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] when the body is malformed, has no
/// instance record, or carries an unparseable port binding.
pub fn decode_status(body: &str) -> Result<StatusReport, ProviderError> {
    let payload: InstancePayload = serde_json::from_str(body)
        .map_err(|err| ProviderError::malformed("instance_status", err.to_string()))?;
    let instance = payload.instances.ok_or_else(|| {
        ProviderError::malformed("instance_status", "response has no instance record")
    })?;

    let status = InstanceStatus::from_provider(instance.actual_status.as_deref());
    let endpoint = if status == InstanceStatus::Running {
        resolve_endpoint(instance.details)?
    } else {
        None
    };
    Ok(StatusReport { status, endpoint })
}

fn resolve_endpoint(details: Map<String, Value>) -> Result<Option<Endpoint>, ProviderError> {
    let instance: WireEndpoint = serde_json::from_value(Value::Object(details))
        .map_err(|err| ProviderError::malformed("instance_status", err.to_string()))?;
    if let (Some(host), Some(port)) = (non_empty(instance.ssh_host.as_deref()), instance.ssh_port)
    {
        return Ok(Some(Endpoint {
            host: host.to_owned(),
            port,
        }));
    }

    let Some(host) = non_empty(instance.public_ipaddr.as_deref()) else {
        return Ok(None);
    };
    let Some(binding) = instance
        .ports
        .as_ref()
        .and_then(|ports| ports.get(SSH_PORT_KEY))
        .and_then(Option::as_ref)
        .and_then(|bindings| bindings.first())
    else {
        return Ok(None);
    };
    let port = binding.host_port.trim().parse::<u16>().map_err(|err| {
        ProviderError::malformed(
            "instance_status",
            format!("invalid host port {:?}: {err}", binding.host_port),
        )
    })?;
    Ok(Some(Endpoint {
        host: host.to_owned(),
        port,
    }))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
