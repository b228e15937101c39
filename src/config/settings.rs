//! Typed run settings.
//!
//! A [`Settings`] value is built once by [`super::ConfigParser`], validated by
//! [`super::ConfigValidator`] and then only read.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::capacity::Market;
use crate::error::ConfigError;
use crate::lifecycle::PollSettings;
use crate::retry::RetryPolicy;
use crate::runpod::{RUNPOD_GRAPHQL_URL, RUNPOD_REST_URL};
use crate::selector::SelectionConstraint;
use crate::tunnel::{TunnelSettings, TunnelSpec};

/// Publicly known password. Configuring it is allowed but draws a warning.
pub const DEFAULT_SSH_PASSWORD: &str = "podlease";

/// Default minimum VRAM in GB.
pub const DEFAULT_MIN_VRAM_GB: u32 = 16;

/// Default on-demand cost ceiling in USD per hour.
pub const DEFAULT_MAX_COST_PER_HOUR: f64 = 1.0;

/// Default interruptible cost ceiling in USD per hour.
pub const DEFAULT_SPOT_MAX_COST_PER_HOUR: f64 = 0.30;

/// Default image.
pub const DEFAULT_DOCKER_IMAGE: &str = "kajdo/kokoro-fastapi:latest";

/// Default container disk in GB.
pub const DEFAULT_CONTAINER_DISK_GB: u32 = 50;

/// Smallest container disk the pod image fits on.
pub const MIN_CONTAINER_DISK_GB: u32 = 10;

/// Default forwards.
pub const DEFAULT_TUNNEL_PORTS: &str = "8880:8880/api,8881:8881/whisper,2222:22/ssh";

/// Default pod name prefix.
pub const DEFAULT_POD_NAME_PREFIX: &str = "podlease";

/// What to do when a pod does not become ready in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisionTimeoutPolicy {
    /// Abort the run.
    #[default]
    Fail,
    /// Release the pod and try the next cheapest offering.
    NextOffering,
}

impl FromStr for ProvisionTimeoutPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "next-offering" | "next_offering" => Ok(Self::NextOffering),
            other => Err(ConfigError::parse(
                format!("expected 'fail' or 'next-offering', got '{other}'"),
                "ON_PROVISION_TIMEOUT",
            )),
        }
    }
}

impl fmt::Display for ProvisionTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::NextOffering => write!(f, "next-offering"),
        }
    }
}

/// Everything a run needs to know, loaded once.
#[derive(Clone, PartialEq)]
pub struct Settings {
    /// `RunPod` API key.
    pub api_key: String,
    /// Password for password-based SSH. Random per run unless configured.
    pub ssh_password: String,
    /// Explicit private key.
    pub ssh_key_path: Option<PathBuf>,
    /// Minimum VRAM in GB.
    pub min_vram_gb: u32,
    /// On-demand cost ceiling.
    pub max_cost_per_hour: f64,
    /// Interruptible cost ceiling.
    pub spot_max_cost_per_hour: f64,
    /// Image to run.
    pub docker_image: String,
    /// Container disk in GB.
    pub container_disk_gb: u32,
    /// Forwards to open once the pod is ready.
    pub tunnels: Vec<TunnelSpec>,
    /// Prefix for pod names; `stop` only touches pods carrying it.
    pub pod_name_prefix: String,
    /// Provisioning poll schedule.
    pub poll: PollSettings,
    /// Backoff for API calls.
    pub retry: RetryPolicy,
    /// Tunnel timing.
    pub tunnel: TunnelSettings,
    /// Behaviour on provisioning timeout.
    pub on_provision_timeout: ProvisionTimeoutPolicy,
    /// REST API base URL.
    pub rest_url: String,
    /// GraphQL API URL.
    pub graphql_url: String,
}

/// Returns a fresh 32-character password for one run.
#[must_use]
pub fn generate_ssh_password() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Settings {
    /// Creates settings with every default and the given API key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ssh_password: generate_ssh_password(),
            ssh_key_path: None,
            min_vram_gb: DEFAULT_MIN_VRAM_GB,
            max_cost_per_hour: DEFAULT_MAX_COST_PER_HOUR,
            spot_max_cost_per_hour: DEFAULT_SPOT_MAX_COST_PER_HOUR,
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            container_disk_gb: DEFAULT_CONTAINER_DISK_GB,
            tunnels: TunnelSpec::parse_list(DEFAULT_TUNNEL_PORTS).unwrap_or_default(),
            pod_name_prefix: DEFAULT_POD_NAME_PREFIX.to_string(),
            poll: PollSettings::default(),
            retry: RetryPolicy::default(),
            tunnel: TunnelSettings::default(),
            on_provision_timeout: ProvisionTimeoutPolicy::default(),
            rest_url: RUNPOD_REST_URL.to_string(),
            graphql_url: RUNPOD_GRAPHQL_URL.to_string(),
        }
    }

    /// Returns the market for a run.
    #[must_use]
    pub const fn market(spot: bool) -> Market {
        if spot {
            Market::Interruptible
        } else {
            Market::OnDemand
        }
    }

    /// Returns the selection constraint for a run.
    ///
    /// Spot runs are capped by the lower of both cost ceilings.
    #[must_use]
    pub fn constraint(&self, spot: bool) -> SelectionConstraint {
        let max_cost_per_hour = if spot {
            self.max_cost_per_hour.min(self.spot_max_cost_per_hour)
        } else {
            self.max_cost_per_hour
        };

        SelectionConstraint {
            min_vram_gb: self.min_vram_gb,
            max_cost_per_hour,
            market: Self::market(spot),
        }
    }

    /// Returns the masked API key for display.
    #[must_use]
    pub fn masked_api_key(&self) -> String {
        let visible: String = self.api_key.chars().take(8).collect();
        format!("{visible}***")
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &self.masked_api_key())
            .field("ssh_key_path", &self.ssh_key_path)
            .field("min_vram_gb", &self.min_vram_gb)
            .field("max_cost_per_hour", &self.max_cost_per_hour)
            .field("spot_max_cost_per_hour", &self.spot_max_cost_per_hour)
            .field("docker_image", &self.docker_image)
            .field("container_disk_gb", &self.container_disk_gb)
            .field("tunnels", &self.tunnels)
            .field("pod_name_prefix", &self.pod_name_prefix)
            .field("poll", &self.poll)
            .field("retry", &self.retry)
            .field("tunnel", &self.tunnel)
            .field("on_provision_timeout", &self.on_provision_timeout)
            .field("rest_url", &self.rest_url)
            .field("graphql_url", &self.graphql_url)
            .finish_non_exhaustive()
    }
}

/// Values given on the command line, applied over every other source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    /// Image to deploy.
    pub docker_image: Option<String>,
    /// Minimum VRAM in GB.
    pub min_vram_gb: Option<u32>,
    /// On-demand cost ceiling.
    pub max_cost_per_hour: Option<f64>,
}

impl ConfigOverrides {
    /// Applies the overrides.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(image) = &self.docker_image {
            settings.docker_image.clone_from(image);
        }
        if let Some(min_vram_gb) = self.min_vram_gb {
            settings.min_vram_gb = min_vram_gb;
        }
        if let Some(max_cost) = self.max_cost_per_hour {
            settings.max_cost_per_hour = max_cost;
        }
    }
}
