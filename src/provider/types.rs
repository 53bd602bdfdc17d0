//! Typed values exchanged with the provider.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// A priced, rentable resource unit advertised by the provider.
///
/// Offers are a point-in-time snapshot and are never updated in place.
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
    /// Provider offer identifier.
    pub id: u64,
    /// Accelerator model (for example `RTX 3060`).
    pub gpu_name: String,
    /// Number of accelerators bundled with the offer.
    pub num_gpus: u32,
    /// Disk space available, in gigabytes.
    pub disk_space_gb: f64,
    /// Total price per hour in USD.
    pub price_per_hour: f64,
    /// Whether the offer can currently be rented.
    pub rentable: bool,
    /// Minimum bid price per hour, when the provider advertises one.
    pub min_bid: Option<f64>,
    /// Host verification label (for example `verified`).
    pub verification: Option<String>,
}

/// Structural constraints applied by the provider during offer search.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OfferFilter {
    /// Minimum disk space in gigabytes.
    pub min_disk_gb: u32,
    /// Restrict results to verified hosts.
    pub verified_only: bool,
    /// Maximum number of offers to return.
    pub limit: u32,
}

impl Default for OfferFilter {
    fn default() -> Self {
        Self {
            min_disk_gb: 30,
            verified_only: false,
            limit: 10,
        }
    }
}

/// Fixed deployment settings sent with every creation request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeploymentTemplate {
    /// Provider template identifier, when deploying from a saved template.
    pub template_id: Option<u64>,
    /// Provider template hash, paired with `template_id`.
    pub template_hash_id: Option<String>,
    /// Container image reference.
    pub image: String,
    /// Ports exposed by the container.
    pub ports: Vec<u16>,
    /// Environment variables passed to the container.
    pub env: BTreeMap<String, String>,
    /// Command run when the instance starts.
    pub onstart: String,
    /// Provider run type (for example `ssh_direc ssh_proxy`).
    pub runtype: String,
    /// Disk size in gigabytes.
    pub disk_gb: u32,
    /// Minimum rental duration in seconds.
    pub min_duration_secs: u64,
}

/// Provider-assigned instance (contract) identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status normalised from provider-defined strings.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstanceStatus {
    /// Rented but not yet scheduled.
    Created,
    /// Image pulling or container starting.
    Loading,
    /// Active and running.
    Running,
    /// The provider reported a failure.
    Error,
    /// Any status outside the known set.
    Unknown,
}

impl InstanceStatus {
    /// Normalises a raw provider status. A missing status means the
    /// instance has only just been created.
    #[must_use]
    pub fn from_provider(raw: Option<&str>) -> Self {
        let Some(value) = raw else {
            return Self::Created;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "loading" => Self::Loading,
            "running" => Self::Running,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network endpoint used to reach an instance over SSH.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of a single status lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusReport {
    /// Normalised lifecycle status.
    pub status: InstanceStatus,
    /// Endpoint, present only when the instance is running.
    pub endpoint: Option<Endpoint>,
}

impl StatusReport {
    /// Returns `true` once the instance is running with a non-empty endpoint.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == InstanceStatus::Running
            && self
                .endpoint
                .as_ref()
                .is_some_and(|endpoint| !endpoint.host.is_empty())
    }
}

/// Handle recorded when an instance is created. These attributes never
/// change after creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider-assigned identifier.
    pub id: InstanceId,
    /// Offer the instance was rented from.
    pub offer_id: u64,
    /// Local time at which creation succeeded.
    pub created_at: SystemTime,
}

/// A provisioned instance together with its last observed status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    handle: InstanceHandle,
    status: InstanceStatus,
    endpoint: Option<Endpoint>,
}

impl Instance {
    /// Wraps a freshly created handle; status starts as `created`.
    #[must_use]
    pub const fn new(handle: InstanceHandle) -> Self {
        Self {
            handle,
            status: InstanceStatus::Created,
            endpoint: None,
        }
    }

    /// Applies a status observation. Only status and endpoint change.
    pub fn observe(&mut self, report: StatusReport) {
        self.status = report.status;
        self.endpoint = report.endpoint;
    }

    /// Provider identifier.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.handle.id
    }

    /// Creation-time attributes.
    #[must_use]
    pub const fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    /// Last observed status.
    #[must_use]
    pub const fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Last observed endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Returns `true` when the last observation was running with an
    /// endpoint.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == InstanceStatus::Running
            && self
                .endpoint
                .as_ref()
                .is_some_and(|endpoint| !endpoint.host.is_empty())
    }
}
