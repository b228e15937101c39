//! Supervision of the forwarding process group.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BindMode, ProcessLauncher, SshAuth, SshCommand, TunnelSpec, TunnelTarget};
use crate::error::{Result, TunnelError};

/// Default time a fresh session must survive before it counts as started.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(3);

/// Default ceiling for the whole tunnel startup.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a killed session to be reaped.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(5);

/// Delay between two local port checks.
const LISTEN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Longest stderr excerpt kept in errors.
const MAX_STDERR: usize = 500;

/// Stderr lines remembered per session.
const STDERR_TAIL_LINES: usize = 20;

/// How long a dead session's stderr may take to reach EOF.
const STDERR_FLUSH: Duration = Duration::from_secs(1);

/// Tunnel timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSettings {
    /// Time each session must stay alive after spawning.
    pub settle: Duration,
    /// Ceiling for starting every session.
    pub startup_timeout: Duration,
    /// Time to wait for a killed session to be reaped.
    pub reap_grace: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            settle: DEFAULT_SETTLE,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            reap_grace: DEFAULT_REAP_GRACE,
        }
    }
}

/// Why [`TunnelManager::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Cancellation was requested.
    Cancelled,
    /// Every session exited on its own.
    AllExited,
}

struct TunnelProcess {
    spec: TunnelSpec,
    child: Child,
    stderr: StderrTail,
}

/// Background reader of one session's stderr.
///
/// ssh blocks once its stderr pipe is full, so the pipe is drained for the
/// whole life of the session. Only the last lines are kept.
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn follow(label: &str, pipe: Option<ChildStderr>) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let drain = pipe.map(|pipe| {
            let lines = Arc::clone(&lines);
            let label = label.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(pipe).lines();
                loop {
                    match reader.next_line().await {
                        Ok(Some(line)) => {
                            debug!("[{label}] {line}");
                            let mut tail = lines.lock().unwrap_or_else(PoisonError::into_inner);
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Stopped reading stderr of tunnel {label}: {e}");
                            break;
                        }
                    }
                }
            })
        });
        Self { lines, drain }
    }

    /// Waits briefly for the reader to hit EOF.
    async fn flush(&mut self) {
        if let Some(mut drain) = self.drain.take()
            && tokio::time::timeout(STDERR_FLUSH, &mut drain).await.is_err()
        {
            drain.abort();
        }
    }

    fn stop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }

    /// The remembered tail, capped to [`MAX_STDERR`] characters.
    fn excerpt(&self) -> String {
        let joined = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let skip = joined.chars().count().saturating_sub(MAX_STDERR);
        joined.chars().skip(skip).collect::<String>().trim().to_string()
    }
}

/// Owns every forwarding process of the run.
pub struct TunnelManager {
    launcher: Arc<dyn ProcessLauncher>,
    auth: SshAuth,
    settings: TunnelSettings,
    processes: Vec<TunnelProcess>,
}

impl TunnelManager {
    /// Creates a manager with no sessions.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, auth: SshAuth, settings: TunnelSettings) -> Self {
        Self {
            launcher,
            auth,
            settings,
            processes: Vec::new(),
        }
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.processes.len()
    }

    /// Specs of the tracked sessions.
    #[must_use]
    pub fn active_specs(&self) -> Vec<TunnelSpec> {
        self.processes.iter().map(|p| p.spec.clone()).collect()
    }

    /// Starts one session per spec and returns the bind mode used.
    ///
    /// Either every session is up when this returns `Ok`, or none is
    /// tracked anymore.
    ///
    /// # Errors
    ///
    /// Returns a [`TunnelError`] when a session fails to spawn, dies during
    /// its settle window, never starts listening, or the startup ceiling is
    /// exceeded.
    pub async fn start(&mut self, target: &TunnelTarget, specs: &[TunnelSpec]) -> Result<BindMode> {
        info!(
            "Opening {} tunnels to {}@{}:{} ({})",
            specs.len(),
            target.user,
            target.host,
            target.ssh_port,
            self.auth.describe()
        );

        let timeout = self.settings.startup_timeout;
        let result = match tokio::time::timeout(timeout, self.start_sessions(target, specs)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout {
                waited_secs: timeout.as_secs(),
            }
            .into()),
        };

        if let Err(e) = &result {
            warn!("Tunnel startup failed: {e}");
            let stopped = self.stop_all().await;
            debug!("Rolled back {stopped} tunnel sessions");
        }
        result
    }

    async fn start_sessions(&mut self, target: &TunnelTarget, specs: &[TunnelSpec]) -> Result<BindMode> {
        let bind = self.choose_bind(specs)?;

        for spec in specs {
            let command = SshCommand::forward(target, spec, bind, &self.auth);
            debug!("Starting tunnel {}: {command}", spec.label);

            let mut child = self.launcher.spawn(&command).map_err(|e| TunnelError::Spawn {
                label: spec.label.clone(),
                message: e.to_string(),
            })?;
            let stderr = StderrTail::follow(&spec.label, child.stderr.take());
            self.processes.push(TunnelProcess {
                spec: spec.clone(),
                child,
                stderr,
            });

            tokio::time::sleep(self.settings.settle).await;
            self.ensure_alive().await?;

            while !self.launcher.is_listening(spec.local_port).await {
                self.ensure_alive().await?;
                tokio::time::sleep(LISTEN_CHECK_INTERVAL).await;
            }

            info!(
                "Tunnel {} up: {}:{} -> {}",
                spec.label, bind, spec.local_port, spec.remote_port
            );
        }

        Ok(bind)
    }

    fn choose_bind(&self, specs: &[TunnelSpec]) -> Result<BindMode> {
        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        if specs.iter().all(|s| self.launcher.can_bind(wildcard, s.local_port)) {
            return Ok(BindMode::Wildcard);
        }

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        match specs.iter().find(|s| !self.launcher.can_bind(loopback, s.local_port)) {
            Some(spec) => Err(TunnelError::BindUnavailable {
                port: spec.local_port,
            }
            .into()),
            None => {
                warn!("Cannot bind on {wildcard}; tunnels are only reachable from this machine");
                Ok(BindMode::Loopback)
            }
        }
    }

    /// Fails if the most recently started session has exited.
    async fn ensure_alive(&mut self) -> Result<()> {
        let Some(process) = self.processes.last_mut() else {
            return Ok(());
        };

        let status = match process.child.try_wait() {
            Ok(None) => return Ok(()),
            Ok(Some(status)) => status.to_string(),
            Err(e) => e.to_string(),
        };

        process.stderr.flush().await;
        let stderr = process.stderr.excerpt();

        Err(TunnelError::StartFailed {
            label: process.spec.label.clone(),
            local_port: process.spec.local_port,
            message: if stderr.is_empty() {
                format!("exited ({status})")
            } else {
                format!("exited ({status}): {stderr}")
            },
        }
        .into())
    }

    /// Stops every tracked session and returns how many were tracked.
    ///
    /// Safe to call any number of times.
    pub async fn stop_all(&mut self) -> usize {
        let processes = std::mem::take(&mut self.processes);
        let count = processes.len();

        for mut process in processes {
            self.launcher
                .terminate(&process.spec, &mut process.child, self.settings.reap_grace)
                .await;
            process.stderr.stop();
        }

        if count > 0 {
            info!("Stopped {count} tunnels");
        }
        count
    }

    /// Blocks until every session has exited or `cancel` turns true.
    pub async fn wait(&mut self, mut cancel: watch::Receiver<bool>) -> WaitOutcome {
        for process in &mut self.processes {
            tokio::select! {
                status = process.child.wait() => match status {
                    Ok(status) => warn!("Tunnel {} exited ({status})", process.spec.label),
                    Err(e) => warn!("Lost track of tunnel {}: {e}", process.spec.label),
                },
                _ = cancel.wait_for(|cancelled| *cancelled) => return WaitOutcome::Cancelled,
            }
        }
        WaitOutcome::AllExited
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("auth", &self.auth)
            .field("settings", &self.settings)
            .field("active", &self.active_specs())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;
    use tokio::process::Command;

    /// Writes as many refused-channel lines as a busy ssh session would.
    const CHATTY_SESSION: &str = r#"i=0
while [ $i -lt 2000 ]; do
  echo "channel $i: open failed: connect failed: Connection refused" >&2
  i=$((i+1))
done
touch "$1"
exec sleep 30"#;

    /// Spawns `sleep`, or a failing shell for the configured attempt.
    struct FakeLauncher {
        fail_on: Option<usize>,
        loopback_only: bool,
        chatty_marker: Option<PathBuf>,
        spawned: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
    }

    impl FakeLauncher {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                fail_on,
                loopback_only: false,
                chatty_marker: None,
                spawned: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ProcessLauncher for FakeLauncher {
        fn can_bind(&self, addr: IpAddr, _port: u16) -> bool {
            !(self.loopback_only && addr.is_unspecified())
        }

        fn spawn(&self, command: &SshCommand) -> io::Result<Child> {
            let mut spawned = self.spawned.lock().expect("lock");
            let attempt = spawned.len();
            spawned.push(command.to_string());

            let mut fake = if self.fail_on == Some(attempt) {
                let mut c = Command::new("sh");
                c.args([
                    "-c",
                    "i=0; while [ $i -lt 100 ]; do echo \"debug1: line $i\" >&2; i=$((i+1)); done; \
                     echo 'bind: Address already in use' >&2; exit 255",
                ]);
                c
            } else if let Some(marker) = &self.chatty_marker {
                let mut c = Command::new("sh");
                c.args(["-c", CHATTY_SESSION, "sh"]).arg(marker);
                c
            } else {
                let mut c = Command::new("sleep");
                c.arg("30");
                c
            };
            fake.stderr(std::process::Stdio::piped()).kill_on_drop(true).spawn()
        }

        async fn is_listening(&self, _port: u16) -> bool {
            true
        }

        async fn terminate(&self, spec: &TunnelSpec, child: &mut Child, grace: Duration) {
            self.stopped.lock().expect("lock").push(spec.label.clone());
            super::super::kill_and_reap(&spec.label, child, grace).await;
        }
    }

    fn settings() -> TunnelSettings {
        TunnelSettings {
            settle: Duration::from_millis(200),
            startup_timeout: Duration::from_secs(10),
            reap_grace: Duration::from_secs(2),
        }
    }

    fn specs() -> Vec<TunnelSpec> {
        TunnelSpec::parse_list("8880:8880/api,8881:8881/whisper,2222:22").expect("valid")
    }

    fn target() -> TunnelTarget {
        TunnelTarget::new("203.0.113.5", 40022)
    }

    fn auth() -> SshAuth {
        SshAuth::Password(String::from("secret"))
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let launcher = Arc::new(FakeLauncher::new(None));
        let mut manager = TunnelManager::new(launcher.clone(), auth(), settings());

        let bind = manager.start(&target(), &specs()).await.expect("all up");
        assert_eq!(bind, BindMode::Wildcard);
        assert_eq!(manager.active_count(), 3);

        let spawned = launcher.spawned.lock().expect("lock").clone();
        assert!(spawned[0].contains("-L 0.0.0.0:8880:127.0.0.1:8880"));
        assert!(spawned[2].contains("-L 0.0.0.0:2222:127.0.0.1:22"));

        assert_eq!(manager.stop_all().await, 3);
        assert_eq!(manager.stop_all().await, 0);
        assert_eq!(launcher.stopped.lock().expect("lock").len(), 3);
    }

    #[tokio::test]
    async fn test_failed_session_rolls_back_the_group() {
        let launcher = Arc::new(FakeLauncher::new(Some(1)));
        let mut manager = TunnelManager::new(launcher.clone(), auth(), settings());

        let err = manager
            .start(&target(), &specs())
            .await
            .expect_err("second session dies");

        let message = err.to_string();
        assert!(message.contains("whisper"), "{message}");
        assert!(message.contains("Address already in use"), "{message}");
        // Only the tail of a long stderr is reported.
        assert!(message.contains("line 99"), "{message}");
        assert!(!message.contains("line 10\n"), "{message}");
        assert_eq!(manager.active_count(), 0);
        // The third session is never attempted.
        assert_eq!(launcher.spawned.lock().expect("lock").len(), 2);
        assert_eq!(
            *launcher.stopped.lock().expect("lock"),
            vec![String::from("api"), String::from("whisper")]
        );
    }

    #[tokio::test]
    async fn test_loopback_fallback() {
        let launcher = Arc::new(FakeLauncher {
            loopback_only: true,
            ..FakeLauncher::new(None)
        });
        let mut manager = TunnelManager::new(launcher.clone(), auth(), settings());

        let bind = manager
            .start(&target(), &specs()[..1])
            .await
            .expect("loopback works");
        assert_eq!(bind, BindMode::Loopback);
        assert!(launcher.spawned.lock().expect("lock")[0].contains("-L 127.0.0.1:8880"));
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_startup_timeout_rolls_back() {
        let launcher = Arc::new(FakeLauncher::new(None));
        let mut manager = TunnelManager::new(
            launcher,
            auth(),
            TunnelSettings {
                settle: Duration::from_secs(5),
                startup_timeout: Duration::from_millis(300),
                reap_grace: Duration::from_secs(2),
            },
        );

        let err = manager.start(&target(), &specs()).await.expect_err("too slow");
        assert!(err.to_string().contains("did not finish"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let launcher = Arc::new(FakeLauncher::new(None));
        let mut manager = TunnelManager::new(launcher, auth(), settings());
        manager.start(&target(), &specs()[..1]).await.expect("up");

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        assert_eq!(manager.wait(rx).await, WaitOutcome::Cancelled);
        assert_eq!(manager.stop_all().await, 1);
    }

    #[tokio::test]
    async fn test_chatty_session_is_not_blocked_on_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("done");
        let launcher = Arc::new(FakeLauncher {
            chatty_marker: Some(marker.clone()),
            ..FakeLauncher::new(None)
        });
        let mut manager = TunnelManager::new(launcher, auth(), settings());
        manager.start(&target(), &specs()[..1]).await.expect("up");

        let mut waited = Duration::ZERO;
        while !marker.exists() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
        assert!(marker.exists(), "session stalled writing to stderr");
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.stop_all().await, 1);
    }
}
