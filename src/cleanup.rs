//! Signal-driven teardown.
//!
//! The first SIGINT/SIGTERM flips the shared cancellation flag and starts
//! teardown: tunnels first, then the pod. Teardown runs at most once, no
//! matter how many signals arrive or how many callers ask for it.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::{LifecycleManager, TerminationOutcome};
use crate::tunnel::TunnelManager;

/// What asked for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// The orchestration sequence itself.
    Internal,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "Ctrl+C"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Internal => write!(f, "shutdown request"),
        }
    }
}

/// Result of the single teardown pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tunnel sessions that were stopped.
    pub tunnels_stopped: usize,
    /// Termination outcome, or why it could not be confirmed.
    pub termination: Result<TerminationOutcome, String>,
}

impl CleanupReport {
    /// Returns true when the pod is known not to be billing anymore.
    #[must_use]
    pub const fn confirmed(&self) -> bool {
        self.termination.is_ok()
    }
}

/// Coordinates cancellation and teardown for one run.
pub struct CleanupCoordinator {
    lifecycle: Arc<Mutex<LifecycleManager>>,
    tunnels: Arc<Mutex<TunnelManager>>,
    cancel_tx: watch::Sender<bool>,
    report: OnceCell<CleanupReport>,
    triggers: AtomicU32,
}

impl CleanupCoordinator {
    /// Creates a coordinator over the run's lifecycle and tunnel managers.
    #[must_use]
    pub fn new(lifecycle: Arc<Mutex<LifecycleManager>>, tunnels: Arc<Mutex<TunnelManager>>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            lifecycle,
            tunnels,
            cancel_tx,
            report: OnceCell::new(),
            triggers: AtomicU32::new(0),
        }
    }

    /// Returns a receiver that turns `true` once cancellation is requested.
    #[must_use]
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Records a signal. The first one cancels the run and starts teardown
    /// in the background; later ones only mark the exit as forced.
    pub fn trigger(self: &Arc<Self>, source: SignalSource) {
        let count = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_tx.send_replace(true);

        if count == 1 {
            info!("Received {source}, shutting down");
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run().await;
            });
        } else {
            warn!("Received {source} again; exiting as soon as the pod is terminated");
        }
    }

    /// Returns true when more than one signal was received.
    #[must_use]
    pub fn forced_exit(&self) -> bool {
        self.triggers.load(Ordering::SeqCst) >= 2
    }

    /// Runs teardown, or waits for the teardown already in progress, and
    /// returns its report.
    pub async fn run(&self) -> CleanupReport {
        self.report.get_or_init(|| self.teardown()).await.clone()
    }

    async fn teardown(&self) -> CleanupReport {
        self.cancel_tx.send_replace(true);

        let tunnels_stopped = self.tunnels.lock().await.stop_all().await;

        let termination = self
            .lifecycle
            .lock()
            .await
            .terminate()
            .await
            .map_err(|e| e.to_string());

        match &termination {
            Ok(outcome) => info!("Cleanup complete: {outcome}"),
            Err(e) => error!("Cleanup could not confirm termination: {e}"),
        }

        CleanupReport {
            tunnels_stopped,
            termination,
        }
    }
}

impl fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("cancelled", &self.is_cancelled())
            .field("triggers", &self.triggers.load(Ordering::SeqCst))
            .field("report", &self.report.get())
            .finish_non_exhaustive()
    }
}

/// Spawns a task forwarding SIGINT and SIGTERM to `coordinator`.
pub fn spawn_signal_listener(coordinator: Arc<CleanupCoordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                None
            }
        };

        loop {
            #[cfg(unix)]
            let source = tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => SignalSource::Interrupt,
                    Err(e) => {
                        error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                },
                Some(()) = recv_terminate(&mut terminate) => SignalSource::Terminate,
            };

            #[cfg(not(unix))]
            let source = match signal::ctrl_c().await {
                Ok(()) => SignalSource::Interrupt,
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {e}");
                    return;
                }
            };

            coordinator.trigger(source);
        }
    })
}

#[cfg(unix)]
async fn recv_terminate(stream: &mut Option<signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{
        CapacityBackend, GpuOffering, InstanceRequest, InstanceSnapshot, Market, RemoteStatus,
        TerminateResult,
    };
    use crate::error::{CapacityError, Result};
    use crate::lifecycle::PollSettings;
    use crate::tunnel::{ProcessLauncher, SshAuth, SshCommand, TunnelSettings};
    use async_trait::async_trait;
    use mockall::mock;
    use std::collections::BTreeMap;

    mock! {
        pub Backend {}

        #[async_trait]
        impl CapacityBackend for Backend {
            async fn list_offerings(&self, market: Market) -> Result<Vec<GpuOffering>>;
            async fn create_instance(&self, request: &InstanceRequest) -> Result<InstanceSnapshot>;
            async fn get_instance(&self, id: &str) -> Result<InstanceSnapshot>;
            async fn terminate_instance(&self, id: &str) -> Result<TerminateResult>;
            async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>>;
        }
    }

    struct NoLauncher;

    impl ProcessLauncher for NoLauncher {
        fn spawn(&self, _command: &SshCommand) -> std::io::Result<tokio::process::Child> {
            Err(std::io::Error::other("not in tests"))
        }
    }

    fn request() -> InstanceRequest {
        InstanceRequest {
            name: String::from("podlease-test"),
            image: String::from("img"),
            offering_id: String::from("NVIDIA L4"),
            gpu_count: 1,
            ports: vec![String::from("22/tcp")],
            disk_gb: 20,
            market: Market::OnDemand,
            env: BTreeMap::new(),
        }
    }

    async fn coordinator(terminate: Result<TerminateResult>) -> Arc<CleanupCoordinator> {
        let mut backend = MockBackend::new();
        backend.expect_create_instance().returning(|_| {
            Ok(InstanceSnapshot {
                id: String::from("pod-1"),
                name: String::from("podlease-test"),
                status: RemoteStatus::Created,
                public_ip: None,
                ssh_port: None,
                image: String::from("img"),
            })
        });
        let mut terminate = Some(terminate);
        backend
            .expect_terminate_instance()
            .times(1)
            .returning(move |_| {
                terminate
                    .take()
                    .unwrap_or_else(|| Ok(TerminateResult::AlreadyGone))
            });

        let mut lifecycle = LifecycleManager::new(Arc::new(backend), PollSettings::default());
        lifecycle.create(&request()).await.expect("created");

        let tunnels = TunnelManager::new(
            Arc::new(NoLauncher),
            SshAuth::Password(String::from("secret")),
            TunnelSettings::default(),
        );

        Arc::new(CleanupCoordinator::new(
            Arc::new(Mutex::new(lifecycle)),
            Arc::new(Mutex::new(tunnels)),
        ))
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let coordinator = coordinator(Ok(TerminateResult::Terminated)).await;

        let (first, second) = tokio::join!(coordinator.run(), coordinator.run());
        assert_eq!(first, second);
        assert!(first.confirmed());
        assert_eq!(first.tunnels_stopped, 0);
        assert!(coordinator.is_cancelled());
    }

    #[tokio::test]
    async fn test_repeated_signals_force_exit_after_single_teardown() {
        let coordinator = coordinator(Ok(TerminateResult::Terminated)).await;
        let mut cancel = coordinator.cancellation();

        coordinator.trigger(SignalSource::Interrupt);
        coordinator.trigger(SignalSource::Interrupt);

        cancel
            .wait_for(|cancelled| *cancelled)
            .await
            .expect("sender alive");
        assert!(coordinator.forced_exit());

        let report = coordinator.run().await;
        assert_eq!(
            report.termination,
            Ok(TerminationOutcome::Terminated {
                id: String::from("pod-1")
            })
        );
    }

    #[tokio::test]
    async fn test_termination_failure_is_reported_not_raised() {
        let coordinator = coordinator(Err(CapacityError::Auth {
            message: String::from("revoked"),
        }
        .into()))
        .await;

        let report = coordinator.run().await;
        assert!(!report.confirmed());
        assert!(report.termination.expect_err("failed").contains("pod-1"));
    }
}
