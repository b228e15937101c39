//! `RunPod` API types and data structures.
//!
//! Wire shapes for the REST pod API and the GraphQL pricing API, plus their
//! mapping into the backend-neutral types of [`crate::capacity`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::capacity::{GpuOffering, InstanceRequest, InstanceSnapshot, Market, RemoteStatus};

/// A pod as returned by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Unique pod identifier.
    pub id: String,
    /// Pod name.
    #[serde(default)]
    pub name: String,
    /// Desired status.
    #[serde(default)]
    pub desired_status: PodStatus,
    /// Image name.
    #[serde(default)]
    pub image: Option<String>,
    /// Public IP, once assigned.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Container port to public port mappings (e.g. `{"22": 40022}`).
    #[serde(default)]
    pub port_mappings: Option<HashMap<String, u16>>,
}

/// Pod status values used by the REST API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodStatus {
    /// Pod is running.
    Running,
    /// Pod has been created but not started.
    Created,
    /// Pod has exited.
    Exited,
    /// Pod has been terminated.
    Terminated,
    /// Unknown status.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Request body for `POST /pods`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePodRequest {
    /// Pod name.
    pub name: String,
    /// Container image.
    pub image_name: String,
    /// Cloud type (SECURE or COMMUNITY).
    pub cloud_type: String,
    /// Compute type, always GPU.
    pub compute_type: String,
    /// Acceptable GPU type ids.
    pub gpu_type_ids: Vec<String>,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// Container disk in GB.
    pub container_disk_in_gb: u32,
    /// Ports to expose (e.g. `22/tcp`).
    pub ports: Vec<String>,
    /// Request a public IP.
    pub support_public_ip: bool,
    /// Spot (interruptible) pricing.
    pub interruptible: bool,
    /// Environment variables.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// GPU type information from the GraphQL API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuType {
    /// GPU type ID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Memory in GB.
    #[serde(default)]
    pub memory_in_gb: u32,
    /// Whether it's available in secure cloud.
    #[serde(default)]
    pub secure_cloud: bool,
    /// Whether it's available in community cloud.
    #[serde(default)]
    pub community_cloud: bool,
    /// On-demand price in secure cloud.
    #[serde(default)]
    pub secure_price: Option<f64>,
    /// On-demand price in community cloud.
    #[serde(default)]
    pub community_price: Option<f64>,
    /// Spot price in secure cloud.
    #[serde(default)]
    pub secure_spot_price: Option<f64>,
    /// Spot price in community cloud.
    #[serde(default)]
    pub community_spot_price: Option<f64>,
    /// Maximum GPUs currently deployable in secure cloud.
    #[serde(default)]
    pub max_gpu_count_secure_cloud: Option<u32>,
    /// Maximum GPUs currently deployable in community cloud.
    #[serde(default)]
    pub max_gpu_count_community_cloud: Option<u32>,
}

/// Runtime port reported by the GraphQL `myself.pods` query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePort {
    /// Container port.
    pub private_port: u16,
    /// Public port.
    #[serde(default)]
    pub public_port: Option<u16>,
    /// Protocol (`tcp`/`udp`/`http`).
    #[serde(rename = "type", default)]
    pub port_type: Option<String>,
}

impl From<PodStatus> for RemoteStatus {
    fn from(status: PodStatus) -> Self {
        match status {
            PodStatus::Running => Self::Running,
            PodStatus::Created => Self::Created,
            PodStatus::Exited => Self::Exited,
            PodStatus::Terminated => Self::Terminated,
            PodStatus::Unknown => Self::Unknown,
        }
    }
}

impl Pod {
    /// Returns the public port mapped to container port 22, if any.
    #[must_use]
    pub fn ssh_port(&self) -> Option<u16> {
        self.port_mappings
            .as_ref()
            .and_then(|m| m.get("22").copied())
            .filter(|port| *port != 0)
    }

    /// Converts the wire pod into a snapshot.
    #[must_use]
    pub fn into_snapshot(self) -> InstanceSnapshot {
        let ssh_port = self.ssh_port();
        InstanceSnapshot {
            id: self.id,
            name: self.name,
            status: self.desired_status.into(),
            public_ip: self.public_ip.filter(|ip| !ip.is_empty()),
            ssh_port,
            image: self.image.unwrap_or_default(),
        }
    }
}

impl GpuType {
    /// Converts the GPU type into an offering priced for `market`'s cloud.
    #[must_use]
    pub fn into_offering(self, market: Market) -> GpuOffering {
        let (listed, on_demand, spot, max_count) = match market {
            Market::OnDemand => (
                self.secure_cloud,
                self.secure_price,
                self.secure_spot_price,
                self.max_gpu_count_secure_cloud,
            ),
            Market::Interruptible => (
                self.community_cloud,
                self.community_price,
                self.community_spot_price,
                self.max_gpu_count_community_cloud,
            ),
        };

        let available = if listed { max_count.unwrap_or(1) } else { 0 };

        GpuOffering {
            display_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            vram_gb: self.memory_in_gb,
            on_demand_cost: on_demand.filter(|p| *p > 0.0),
            interruptible_cost: spot.filter(|p| *p > 0.0),
            available,
        }
    }
}

impl From<&InstanceRequest> for CreatePodRequest {
    fn from(request: &InstanceRequest) -> Self {
        Self {
            name: request.name.clone(),
            image_name: request.image.clone(),
            cloud_type: request.market.cloud_type().to_string(),
            compute_type: String::from("GPU"),
            gpu_type_ids: vec![request.offering_id.clone()],
            gpu_count: request.gpu_count,
            container_disk_in_gb: request.disk_gb,
            ports: request.ports.clone(),
            support_public_ip: true,
            interruptible: request.market.is_interruptible(),
            env: request.env.clone(),
        }
    }
}
