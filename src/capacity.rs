//! Capacity backend abstraction.
//!
//! The orchestrator never talks HTTP directly: it goes through
//! [`CapacityBackend`], which the `RunPod` client implements and tests fake.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

/// Purchasing mode for a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    /// Guaranteed capacity, billed at the on-demand rate.
    #[default]
    OnDemand,
    /// Preemptible capacity, billed at the spot rate.
    Interruptible,
}

impl Market {
    /// Returns the `RunPod` cloud this market is deployed to.
    #[must_use]
    pub const fn cloud_type(self) -> &'static str {
        match self {
            Self::OnDemand => "SECURE",
            Self::Interruptible => "COMMUNITY",
        }
    }

    /// Returns true for the interruptible market.
    #[must_use]
    pub const fn is_interruptible(self) -> bool {
        matches!(self, Self::Interruptible)
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnDemand => write!(f, "on-demand"),
            Self::Interruptible => write!(f, "interruptible"),
        }
    }
}

/// A purchasable GPU configuration, snapshotted for one selection attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuOffering {
    /// Backend identifier of the GPU type.
    pub id: String,
    /// Human readable name.
    pub display_name: String,
    /// VRAM per GPU in GB.
    pub vram_gb: u32,
    /// Hourly on-demand cost in USD, if sold on demand.
    pub on_demand_cost: Option<f64>,
    /// Hourly interruptible cost in USD, if sold interruptibly.
    pub interruptible_cost: Option<f64>,
    /// Units currently available.
    pub available: u32,
}

impl GpuOffering {
    /// Returns the hourly cost for the given market.
    #[must_use]
    pub const fn cost(&self, market: Market) -> Option<f64> {
        match market {
            Market::OnDemand => self.on_demand_cost,
            Market::Interruptible => self.interruptible_cost,
        }
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Pod name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Offering to deploy on.
    pub offering_id: String,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// Ports to expose, in `port/proto` form.
    pub ports: Vec<String>,
    /// Container disk in GB.
    pub disk_gb: u32,
    /// Purchasing mode.
    pub market: Market,
    /// Environment passed to the container.
    pub env: BTreeMap<String, String>,
}

/// Status reported by the backend for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Scheduled but not started.
    Created,
    /// Running.
    Running,
    /// Container exited.
    Exited,
    /// Instance is gone.
    Terminated,
    /// Anything else.
    Unknown,
}

impl RemoteStatus {
    /// Returns true when the instance can no longer become ready.
    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Exited | Self::Terminated)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}

/// A point-in-time view of an instance as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    /// Instance identifier.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Reported status.
    pub status: RemoteStatus,
    /// Public IP address, once assigned.
    pub public_ip: Option<String>,
    /// Public port mapped to the container's SSH port, once assigned.
    pub ssh_port: Option<u16>,
    /// Container image.
    pub image: String,
}

impl InstanceSnapshot {
    /// Returns true when the instance is running and reachable over SSH.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == RemoteStatus::Running
            && self.public_ip.as_deref().is_some_and(|ip| !ip.is_empty())
            && self.ssh_port.is_some()
    }
}

/// Outcome of a terminate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateResult {
    /// The backend accepted the termination.
    Terminated,
    /// The backend no longer knows the instance.
    AlreadyGone,
}

/// Authenticated access to GPU offerings and instance lifecycle commands.
///
/// Implementations apply their own retry policy: an error returned from any
/// method has already exhausted the retry budget or was not retryable.
#[async_trait]
pub trait CapacityBackend: Send + Sync {
    /// Lists GPU offerings priced for the given market.
    async fn list_offerings(&self, market: Market) -> Result<Vec<GpuOffering>>;

    /// Creates an instance.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<InstanceSnapshot>;

    /// Fetches the current state of an instance.
    async fn get_instance(&self, id: &str) -> Result<InstanceSnapshot>;

    /// Terminates an instance. A missing instance is not an error.
    async fn terminate_instance(&self, id: &str) -> Result<TerminateResult>;

    /// Lists every instance owned by the account.
    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>>;
}
