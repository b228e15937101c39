//! The `deploy` and `stop` sequences.
//!
//! `deploy` runs selection, provisioning and tunnel startup one after the
//! other, racing each step against cancellation, then blocks until the
//! tunnels exit or the run is cancelled. Teardown always runs through the
//! [`CleanupCoordinator`], whatever stage the sequence stopped at.

use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::capacity::{CapacityBackend, InstanceRequest, InstanceSnapshot, Market, RemoteStatus};
use crate::cleanup::{CleanupCoordinator, CleanupReport};
use crate::config::{ProvisionTimeoutPolicy, Settings};
use crate::error::{LifecycleError, PodleaseError, SelectionError, Stage, StageError};
use crate::lifecycle::{LifecycleManager, PollSettings, TerminationOutcome};
use crate::selector::{self, Candidate, SelectionConstraint};
use crate::tunnel::{BindMode, ProcessLauncher, SshAuth, TunnelManager, TunnelSettings, TunnelSpec, TunnelTarget, WaitOutcome};

/// Environment variable carrying the run id on the pod.
pub const RUN_ID_ENV: &str = "PODLEASE_RUN_ID";

/// Everything `deploy` needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployPlan {
    /// Selection constraint.
    pub constraint: SelectionConstraint,
    /// Image to run.
    pub image: String,
    /// Container disk in GB.
    pub disk_gb: u32,
    /// Forwards to open.
    pub tunnels: Vec<TunnelSpec>,
    /// Pod name prefix.
    pub name_prefix: String,
    /// Behaviour on provisioning timeout.
    pub on_timeout: ProvisionTimeoutPolicy,
    /// Environment passed to the pod.
    pub env: BTreeMap<String, String>,
}

impl DeployPlan {
    /// Builds a plan from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings, spot: bool) -> Self {
        Self {
            constraint: settings.constraint(spot),
            image: settings.docker_image.clone(),
            disk_gb: settings.container_disk_gb,
            tunnels: settings.tunnels.clone(),
            name_prefix: settings.pod_name_prefix.clone(),
            on_timeout: settings.on_provision_timeout,
            env: BTreeMap::new(),
        }
    }

    /// Adds the pod environment derived from the run id and credentials.
    #[must_use]
    pub fn with_run_env(mut self, run_id: &str, auth: &SshAuth) -> Self {
        self.env.insert(RUN_ID_ENV.to_string(), run_id.to_string());
        match auth {
            SshAuth::Password(password) => {
                self.env.insert(String::from("SSH_PASSWORD"), password.clone());
            }
            SshAuth::Key(_) => {
                if let Some(key) = auth.public_key() {
                    self.env.insert(String::from("PUBLIC_KEY"), key);
                }
            }
        }
        self
    }

    /// Ports exposed on the pod: SSH plus every forwarded remote port.
    #[must_use]
    pub fn instance_ports(&self) -> Vec<String> {
        let mut ports = vec![String::from("22/tcp")];
        for tunnel in &self.tunnels {
            let port = format!("{}/tcp", tunnel.remote_port);
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }

    fn request_for(&self, candidate: &Candidate) -> InstanceRequest {
        InstanceRequest {
            name: pod_name(&self.name_prefix),
            image: self.image.clone(),
            offering_id: candidate.offering.id.clone(),
            gpu_count: 1,
            ports: self.instance_ports(),
            disk_gb: self.disk_gb,
            market: self.constraint.market,
            env: self.env.clone(),
        }
    }
}

/// Returns `<prefix>-<local timestamp>`.
#[must_use]
pub fn pod_name(prefix: &str) -> String {
    format!("{prefix}-{}", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Returns an identifier for this run: a UUID tagged with host and pid.
#[must_use]
pub fn run_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("unknown"));
    format!("{}@{host}:{}", uuid::Uuid::new_v4(), std::process::id())
}

/// Connection details once the pod and its tunnels are up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadyReport {
    /// Pod id.
    pub pod_id: String,
    /// Pod name.
    pub pod_name: String,
    /// GPU the pod runs on.
    pub gpu: String,
    /// VRAM in GB.
    pub vram_gb: u32,
    /// Hourly cost.
    pub cost_per_hour: f64,
    /// Market.
    pub market: Market,
    /// Public address.
    pub public_ip: String,
    /// Public SSH port.
    pub ssh_port: u16,
    /// Local bind mode of the tunnels.
    pub bind: BindMode,
    /// Open forwards.
    pub tunnels: Vec<TunnelSpec>,
}

/// Why `deploy` stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The operator interrupted the run.
    Interrupted,
    /// Every tunnel exited on its own.
    TunnelsExited,
    /// A stage failed.
    Failed(StageError),
}

/// Final result of a `deploy` run.
#[derive(Debug)]
pub struct DeployOutcome {
    /// Why the run stopped.
    pub reason: StopReason,
    /// What cleanup did.
    pub cleanup: CleanupReport,
}

impl DeployOutcome {
    /// Returns true when no stage failed and termination was confirmed.
    #[must_use]
    pub const fn success(&self) -> bool {
        !matches!(self.reason, StopReason::Failed(_)) && self.cleanup.confirmed()
    }
}

/// Drives one run against a capacity backend.
pub struct Orchestrator {
    backend: Arc<dyn CapacityBackend>,
    lifecycle: Arc<Mutex<LifecycleManager>>,
    tunnels: Arc<Mutex<TunnelManager>>,
    coordinator: Arc<CleanupCoordinator>,
}

impl Orchestrator {
    /// Creates an orchestrator with fresh lifecycle and tunnel managers.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CapacityBackend>,
        launcher: Arc<dyn ProcessLauncher>,
        auth: SshAuth,
        poll: PollSettings,
        tunnel: TunnelSettings,
    ) -> Self {
        let lifecycle = Arc::new(Mutex::new(LifecycleManager::new(Arc::clone(&backend), poll)));
        let tunnels = Arc::new(Mutex::new(TunnelManager::new(launcher, auth, tunnel)));
        let coordinator = Arc::new(CleanupCoordinator::new(
            Arc::clone(&lifecycle),
            Arc::clone(&tunnels),
        ));

        Self {
            backend,
            lifecycle,
            tunnels,
            coordinator,
        }
    }

    /// Returns the run's cleanup coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<CleanupCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Fetches offerings and returns every qualifying candidate, best first.
    ///
    /// # Errors
    ///
    /// See [`find_candidates`].
    pub async fn candidates(&self, constraint: &SelectionConstraint) -> Result<Vec<Candidate>, StageError> {
        find_candidates(self.backend.as_ref(), constraint).await
    }

    /// Runs the full sequence, then cleans up.
    ///
    /// `on_ready` is called once the tunnels are up.
    pub async fn deploy<F>(&self, plan: &DeployPlan, on_ready: F) -> DeployOutcome
    where
        F: FnOnce(&ReadyReport),
    {
        let reason = match self.run_sequence(plan, on_ready).await {
            Ok(reason) => reason,
            Err(e) => {
                error!("{e}");
                StopReason::Failed(e)
            }
        };

        let cleanup = self.coordinator.run().await;
        if !cleanup.confirmed() {
            warn!("Check the RunPod console: the pod may still be running");
        }

        DeployOutcome { reason, cleanup }
    }

    async fn run_sequence<F>(&self, plan: &DeployPlan, on_ready: F) -> Result<StopReason, StageError>
    where
        F: FnOnce(&ReadyReport),
    {
        let mut cancel = self.coordinator.cancellation();

        let candidates = tokio::select! {
            result = self.candidates(&plan.constraint) => result?,
            _ = cancel.wait_for(|cancelled| *cancelled) => return Ok(StopReason::Interrupted),
        };

        let Some((candidate, snapshot)) = self.provision(plan, &candidates, &mut cancel).await? else {
            return Ok(StopReason::Interrupted);
        };

        let (Some(public_ip), Some(ssh_port)) = (snapshot.public_ip.clone(), snapshot.ssh_port) else {
            return Err(PodleaseError::internal("ready pod has no SSH endpoint").at(Stage::Provisioning));
        };
        let target = TunnelTarget::new(public_ip.clone(), ssh_port);

        let bind = {
            let mut tunnels = self.tunnels.lock().await;
            tokio::select! {
                result = tunnels.start(&target, &plan.tunnels) => {
                    result.map_err(|e| e.at(Stage::TunnelStartup))?
                }
                _ = cancel.wait_for(|cancelled| *cancelled) => return Ok(StopReason::Interrupted),
            }
        };

        on_ready(&ReadyReport {
            pod_id: snapshot.id.clone(),
            pod_name: snapshot.name.clone(),
            gpu: candidate.offering.display_name.clone(),
            vram_gb: candidate.offering.vram_gb,
            cost_per_hour: candidate.cost_per_hour,
            market: plan.constraint.market,
            public_ip,
            ssh_port,
            bind,
            tunnels: plan.tunnels.clone(),
        });

        let outcome = self.tunnels.lock().await.wait(cancel.clone()).await;
        // Teardown may have emptied the registry before `wait` ran.
        Ok(match outcome {
            _ if self.coordinator.is_cancelled() => StopReason::Interrupted,
            WaitOutcome::Cancelled => StopReason::Interrupted,
            WaitOutcome::AllExited => {
                warn!("All tunnels exited; shutting down");
                StopReason::TunnelsExited
            }
        })
    }

    /// Creates a pod on the first candidate with capacity and waits for it.
    ///
    /// Returns `None` when cancelled.
    async fn provision(
        &self,
        plan: &DeployPlan,
        candidates: &[Candidate],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<(Candidate, InstanceSnapshot)>, StageError> {
        let mut last_error: Option<PodleaseError> = None;

        for candidate in candidates {
            if *cancel.borrow() {
                return Ok(None);
            }

            let request = plan.request_for(candidate);
            info!(
                "Requesting {} ({}GB) at ${:.2}/hr as {}",
                candidate.offering.display_name,
                candidate.offering.vram_gb,
                candidate.cost_per_hour,
                request.name
            );

            let created = self.lifecycle.lock().await.create(&request).await;
            match created {
                Ok(_) => {}
                Err(e) if e.is_capacity_unavailable() => {
                    warn!("{} is sold out, trying the next offering", candidate.offering.id);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e.at(Stage::Provisioning)),
            }

            if *cancel.borrow() {
                return Ok(None);
            }

            let polled = {
                let mut lifecycle = self.lifecycle.lock().await;
                tokio::select! {
                    result = lifecycle.wait_until_running() => Some(result),
                    _ = cancel.wait_for(|cancelled| *cancelled) => None,
                }
            };

            match polled {
                None => return Ok(None),
                Some(Ok(snapshot)) => return Ok(Some((candidate.clone(), snapshot))),
                Some(Err(e))
                    if plan.on_timeout == ProvisionTimeoutPolicy::NextOffering
                        && matches!(
                            e,
                            PodleaseError::Lifecycle(LifecycleError::ProvisioningTimeout { .. })
                        ) =>
                {
                    warn!("{e}; trying the next offering");
                    last_error = Some(e);
                }
                Some(Err(e)) => return Err(e.at(Stage::Provisioning)),
            }
        }

        Err(last_error
            .unwrap_or_else(|| {
                SelectionError::NoCandidate {
                    reason: String::from("no offering left to try"),
                }
                .into()
            })
            .at(Stage::Provisioning))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

/// Fetches offerings and returns every qualifying candidate, best first.
///
/// # Errors
///
/// Returns a selection-stage error when the API call fails or nothing
/// qualifies.
pub async fn find_candidates(
    backend: &dyn CapacityBackend,
    constraint: &SelectionConstraint,
) -> Result<Vec<Candidate>, StageError> {
    info!(
        "Searching {} GPUs with at least {}GB VRAM under ${:.2}/hr",
        constraint.market, constraint.min_vram_gb, constraint.max_cost_per_hour
    );

    let offerings = backend
        .list_offerings(constraint.market)
        .await
        .map_err(|e| e.at(Stage::Selection))?;

    let ranked = selector::rank(&offerings, constraint);
    if ranked.is_empty() {
        return Err(PodleaseError::from(SelectionError::NoCandidate {
            reason: selector::explain_empty(&offerings, constraint),
        })
        .at(Stage::Selection));
    }

    info!("{} of {} offerings qualify", ranked.len(), offerings.len());
    Ok(ranked)
}

/// Terminates every live pod whose name starts with `prefix`.
///
/// Pods are handled one at a time; a failure is reported and the remaining
/// pods are still attempted.
///
/// # Errors
///
/// Returns a cleanup-stage error when the pod list cannot be fetched.
pub async fn stop_matching(
    backend: Arc<dyn CapacityBackend>,
    prefix: &str,
) -> Result<Vec<(InstanceSnapshot, Result<TerminationOutcome, String>)>, StageError> {
    let pods = backend
        .list_instances()
        .await
        .map_err(|e| e.at(Stage::Cleanup))?;

    let targets: Vec<InstanceSnapshot> = pods
        .into_iter()
        .filter(|p| p.name.starts_with(prefix) && p.status != RemoteStatus::Terminated)
        .collect();

    if targets.is_empty() {
        info!("No pods named {prefix}-* are running");
        return Ok(Vec::new());
    }

    let mut results = Vec::with_capacity(targets.len());
    for pod in targets {
        let mut lifecycle = LifecycleManager::new(Arc::clone(&backend), PollSettings::default());
        let outcome = match lifecycle.adopt(&pod) {
            Ok(()) => lifecycle.terminate().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        results.push((pod, outcome));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::GpuOffering;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            offering: GpuOffering {
                id: id.to_string(),
                display_name: id.to_string(),
                vram_gb: 24,
                on_demand_cost: Some(0.4),
                interruptible_cost: None,
                available: 1,
            },
            cost_per_hour: 0.4,
        }
    }

    #[test]
    fn test_plan_from_settings() {
        let settings = Settings::with_api_key("rpa_test");
        let plan = DeployPlan::from_settings(&settings, true)
            .with_run_env("run-1", &SshAuth::Password(String::from("secret")));

        assert_eq!(plan.constraint.market, Market::Interruptible);
        assert_eq!(plan.env.get(RUN_ID_ENV).map(String::as_str), Some("run-1"));
        assert_eq!(plan.env.get("SSH_PASSWORD").map(String::as_str), Some("secret"));
        assert_eq!(plan.instance_ports(), ["22/tcp", "8880/tcp", "8881/tcp"]);
    }

    #[test]
    fn test_request_for_candidate() {
        let plan = DeployPlan::from_settings(&Settings::with_api_key("rpa_test"), false);
        let request = plan.request_for(&candidate("NVIDIA RTX A5000"));

        assert_eq!(request.offering_id, "NVIDIA RTX A5000");
        assert_eq!(request.market, Market::OnDemand);
        assert_eq!(request.gpu_count, 1);
        assert!(request.name.starts_with("podlease-"));
        assert_eq!(request.name.len(), "podlease-".len() + "20250101-120000".len());
    }

    #[test]
    fn test_run_id_is_unique() {
        let id = run_id();
        assert_ne!(id, run_id());
        assert!(id.ends_with(&format!(":{}", std::process::id())));
    }
}
