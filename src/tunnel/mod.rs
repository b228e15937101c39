//! SSH port forwarding to the leased pod.
//!
//! One `ssh -L` process runs per [`TunnelSpec`]; [`TunnelManager`] owns
//! every process handle and tears them down as a group.

mod launcher;
mod manager;
mod ssh;

pub use launcher::{kill_and_reap, ProcessLauncher, SystemLauncher};
pub use manager::{TunnelManager, TunnelSettings, WaitOutcome};
pub use ssh::{SshAuth, SshCommand, DEFAULT_KEY_NAMES};

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::ConfigError;

/// Remote user for every session.
pub const SSH_USER: &str = "root";

/// One local-to-remote port forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelSpec {
    /// Local port to listen on.
    pub local_port: u16,
    /// Port on the pod to forward to.
    pub remote_port: u16,
    /// Service name shown to the operator.
    pub label: String,
}

impl TunnelSpec {
    /// Creates a spec with the default label for `remote_port`.
    #[must_use]
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            label: default_label(remote_port),
        }
    }

    /// Parses a comma separated list of `local:remote[/label]` entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPort`] on a malformed entry.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect()
    }
}

fn default_label(remote_port: u16) -> String {
    if remote_port == 22 {
        String::from("ssh")
    } else {
        format!("port-{remote_port}")
    }
}

impl FromStr for TunnelSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPort {
            spec: s.to_string(),
        };

        let (ports, label) = match s.split_once('/') {
            Some((ports, label)) if !label.trim().is_empty() => (ports, Some(label.trim())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let (local, remote) = ports.split_once(':').ok_or_else(invalid)?;
        let local_port: u16 = local.trim().parse().map_err(|_| invalid())?;
        let remote_port: u16 = remote.trim().parse().map_err(|_| invalid())?;
        if local_port == 0 || remote_port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            local_port,
            remote_port,
            label: label.map_or_else(|| default_label(remote_port), String::from),
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.local_port, self.remote_port, self.label)
    }
}

/// Local address the forwards listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// Every interface (`0.0.0.0`), reachable from the local network.
    Wildcard,
    /// Loopback only (`127.0.0.1`).
    Loopback,
}

impl BindMode {
    /// Returns the address passed to `ssh -L`.
    #[must_use]
    pub const fn addr(self) -> IpAddr {
        match self {
            Self::Wildcard => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// The SSH endpoint of a running pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Public address.
    pub host: String,
    /// Public port mapped to the pod's SSH daemon.
    pub ssh_port: u16,
    /// Remote user.
    pub user: String,
}

impl TunnelTarget {
    /// Creates a target for the default remote user.
    #[must_use]
    pub fn new(host: impl Into<String>, ssh_port: u16) -> Self {
        Self {
            host: host.into(),
            ssh_port,
            user: SSH_USER.to_string(),
        }
    }
}
