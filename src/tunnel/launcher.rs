//! Process boundary for tunnel sessions.
//!
//! `SystemLauncher` starts real `ssh` processes; tests substitute launchers
//! that spawn harmless commands instead.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{debug, warn};

use super::{SshCommand, TunnelSpec};

/// Timeout for a single local port check.
const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Spawns, checks and stops forwarding processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Returns true when `port` can currently be bound on `addr`.
    fn can_bind(&self, addr: IpAddr, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(addr, port)).is_ok()
    }

    /// Starts a forwarding process.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the process cannot be started.
    fn spawn(&self, command: &SshCommand) -> io::Result<Child>;

    /// Returns true once something accepts connections on local `port`.
    async fn is_listening(&self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        matches!(
            tokio::time::timeout(CONNECT_CHECK_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Stops a forwarding process and reaps it.
    async fn terminate(&self, spec: &TunnelSpec, child: &mut Child, grace: Duration) {
        debug!("Stopping tunnel {}", spec.label);
        kill_and_reap(&spec.label, child, grace).await;
    }
}

/// Launches real `ssh` / `sshpass` processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    fn spawn(&self, command: &SshCommand) -> io::Result<Child> {
        command.to_command().spawn()
    }
}

/// Sends SIGKILL to `child` and waits up to `grace` for it to be reaped.
///
/// A process that has already exited is only reaped.
pub async fn kill_and_reap(label: &str, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Tunnel {label} had already exited ({status})");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("Could not query tunnel {label}: {e}"),
    }

    if let Err(e) = child.start_kill() {
        warn!("Failed to kill tunnel {label}: {e}");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Tunnel {label} stopped ({status})"),
        Ok(Err(e)) => warn!("Failed to reap tunnel {label}: {e}"),
        Err(_) => warn!("Tunnel {label} did not exit within {grace:?}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_kill_and_reap_running_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("sleep spawns");

        kill_and_reap("test", &mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().expect("query").is_some());
    }

    #[tokio::test]
    async fn test_kill_and_reap_exited_process() {
        let mut child = Command::new("true").spawn().expect("true spawns");
        child.wait().await.expect("exits");

        kill_and_reap("test", &mut child, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_is_listening_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        assert!(SystemLauncher.is_listening(port).await);
        assert!(!SystemLauncher.can_bind(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
}
