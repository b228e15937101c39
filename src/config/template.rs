//! `.env` generation for `podlease init`.

use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use super::settings::{
    DEFAULT_CONTAINER_DISK_GB, DEFAULT_DOCKER_IMAGE, DEFAULT_MAX_COST_PER_HOUR,
    DEFAULT_MIN_VRAM_GB, DEFAULT_POD_NAME_PREFIX, DEFAULT_SPOT_MAX_COST_PER_HOUR,
    DEFAULT_TUNNEL_PORTS,
};
use crate::error::{ConfigError, PodleaseError, Result};

/// Values written by `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvTemplate {
    /// `RunPod` API key.
    pub api_key: String,
    /// SSH password; left commented out when unset.
    pub ssh_password: Option<String>,
    /// Minimum VRAM in GB.
    pub min_vram_gb: u32,
    /// On-demand cost ceiling.
    pub max_cost_per_hour: f64,
    /// Interruptible cost ceiling.
    pub spot_max_cost_per_hour: f64,
    /// Image.
    pub docker_image: String,
    /// Container disk in GB.
    pub container_disk_gb: u32,
    /// Forward list.
    pub tunnel_ports: String,
}

impl EnvTemplate {
    /// Creates a template with default values.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ssh_password: None,
            min_vram_gb: DEFAULT_MIN_VRAM_GB,
            max_cost_per_hour: DEFAULT_MAX_COST_PER_HOUR,
            spot_max_cost_per_hour: DEFAULT_SPOT_MAX_COST_PER_HOUR,
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            container_disk_gb: DEFAULT_CONTAINER_DISK_GB,
            tunnel_ports: DEFAULT_TUNNEL_PORTS.to_string(),
        }
    }

    /// Renders the file contents.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# Required: RunPod API key (https://www.runpod.io/console/user/settings)"
        );
        let _ = writeln!(out, "RUNPOD_API_KEY={}\n", self.api_key);
        let _ = writeln!(out, "# SSH password set on the pod, used when no local key is found");
        match &self.ssh_password {
            Some(password) => {
                let _ = writeln!(out, "SSH_PASSWORD={password}\n");
            }
            None => {
                let _ = writeln!(out, "# Unset: every run generates its own");
                let _ = writeln!(out, "# SSH_PASSWORD=\n");
            }
        }
        let _ = writeln!(out, "# GPU selection");
        let _ = writeln!(out, "MIN_VRAM_GB={}", self.min_vram_gb);
        let _ = writeln!(out, "MAX_COST_PER_HOUR={}", self.max_cost_per_hour);
        let _ = writeln!(out, "SPOT_MAX_COST_PER_HOUR={}\n", self.spot_max_cost_per_hour);
        let _ = writeln!(out, "# Image to deploy");
        let _ = writeln!(out, "DOCKER_IMAGE={}\n", self.docker_image);
        let _ = writeln!(out, "# Container disk size in GB");
        let _ = writeln!(out, "CONTAINER_DISK_GB={}\n", self.container_disk_gb);
        let _ = writeln!(out, "# Tunnels as local:remote[/label], comma separated");
        let _ = writeln!(out, "TUNNEL_PORTS={}\n", self.tunnel_ports);
        let _ = writeln!(out, "# Pods are named <prefix>-<timestamp>; `stop` only touches this prefix");
        let _ = writeln!(out, "# POD_NAME_PREFIX={DEFAULT_POD_NAME_PREFIX}");
        let _ = writeln!(out, "# What to do when a pod is not ready in time: fail | next-offering");
        let _ = writeln!(out, "# ON_PROVISION_TIMEOUT=fail");
        out
    }

    /// Writes the file, refusing to replace an existing one unless `force`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and `force` is false, or it
    /// cannot be written.
    pub fn write(&self, path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(PodleaseError::Config(ConfigError::validation(
                format!("{} already exists; pass --force to overwrite it", path.display()),
                "--force",
            )));
        }

        std::fs::write(path, self.render())?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
