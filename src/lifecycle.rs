//! Instance lifecycle management.
//!
//! [`InstanceState::apply`] is the whole state machine; [`LifecycleManager`]
//! drives it from backend responses and is the only component that issues
//! create, poll or terminate calls for the tracked pod.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::capacity::{CapacityBackend, InstanceRequest, InstanceSnapshot, TerminateResult};
use crate::error::{LifecycleError, Result};

/// Default delay between two status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling for a pod to become ready.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle state of the tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Create call issued, no handle yet.
    Requested,
    /// Created, waiting for the pod to become reachable.
    Provisioning,
    /// Running with a public address and SSH port.
    Running,
    /// Termination requested.
    Terminating,
    /// Termination confirmed.
    Terminated,
    /// Unrecoverable failure.
    Failed,
}

/// Events that move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The backend accepted the create call.
    Created,
    /// A poll reported the pod running and reachable.
    BecameReady,
    /// Operator or cleanup asked for termination.
    StopRequested,
    /// The backend confirmed termination, or no longer knows the pod.
    TerminateConfirmed,
    /// An unrecoverable error occurred.
    Failure,
}

impl InstanceState {
    /// Returns the state reached by applying `event`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when `event` is not
    /// allowed in this state.
    pub fn apply(self, event: LifecycleEvent) -> std::result::Result<Self, LifecycleError> {
        use InstanceState as S;
        use LifecycleEvent as E;

        match (self, event) {
            (S::Requested, E::Created) => Ok(S::Provisioning),
            (S::Provisioning, E::BecameReady) => Ok(S::Running),
            (S::Requested | S::Provisioning | S::Running, E::StopRequested) => Ok(S::Terminating),
            (S::Terminating, E::TerminateConfirmed) => Ok(S::Terminated),
            (s, E::Failure) if s != S::Terminated => Ok(S::Failed),
            (from, event) => Err(LifecycleError::InvalidTransition { from, event }),
        }
    }

    /// Returns true for states no event can leave (except `Failure` on `Failed`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        write!(f, "{state}")
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = match self {
            Self::Created => "created",
            Self::BecameReady => "became-ready",
            Self::StopRequested => "stop-requested",
            Self::TerminateConfirmed => "terminate-confirmed",
            Self::Failure => "failure",
        };
        write!(f, "{event}")
    }
}

/// Polling schedule while provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between polls.
    pub interval: Duration,
    /// Wall-clock ceiling.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// The instance tracked by this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Backend identifier, assigned on creation.
    pub id: Option<String>,
    /// Pod name.
    pub name: String,
    /// Requested image.
    pub image: String,
    /// Requested ports.
    pub ports: Vec<String>,
    /// Offering it was created on.
    pub offering_id: String,
    /// Current state.
    pub state: InstanceState,
    /// Public address, once ready.
    pub public_ip: Option<String>,
    /// Public SSH port, once ready.
    pub ssh_port: Option<u16>,
}

impl Instance {
    fn requested(request: &InstanceRequest) -> Self {
        Self {
            id: None,
            name: request.name.clone(),
            image: request.image.clone(),
            ports: request.ports.clone(),
            offering_id: request.offering_id.clone(),
            state: InstanceState::Requested,
            public_ip: None,
            ssh_port: None,
        }
    }

    fn transition(&mut self, event: LifecycleEvent) -> std::result::Result<(), LifecycleError> {
        let next = self.state.apply(event)?;
        debug!("Pod {}: {} -> {next} ({event})", self.label(), self.state);
        self.state = next;
        Ok(())
    }

    /// Returns the id when known, else the name.
    #[must_use]
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// What a call to [`LifecycleManager::terminate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// No instance was ever tracked.
    NoInstance,
    /// The instance had already settled; no backend call was made.
    AlreadySettled {
        /// Final state.
        state: InstanceState,
    },
    /// The backend terminated the pod.
    Terminated {
        /// Pod id.
        id: String,
    },
    /// The backend no longer knew the pod.
    AlreadyGone {
        /// Pod id.
        id: String,
    },
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoInstance => write!(f, "no pod was created"),
            Self::AlreadySettled { state } => write!(f, "pod already {state}"),
            Self::Terminated { id } => write!(f, "pod {id} terminated"),
            Self::AlreadyGone { id } => write!(f, "pod {id} was already gone"),
        }
    }
}

/// Drives a single instance through its lifecycle.
pub struct LifecycleManager {
    backend: Arc<dyn CapacityBackend>,
    poll: PollSettings,
    instance: Option<Instance>,
}

impl LifecycleManager {
    /// Creates a manager with no tracked instance.
    #[must_use]
    pub fn new(backend: Arc<dyn CapacityBackend>, poll: PollSettings) -> Self {
        Self {
            backend,
            poll,
            instance: None,
        }
    }

    /// Returns the tracked instance.
    #[must_use]
    pub const fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// Returns the tracked instance's state.
    #[must_use]
    pub fn state(&self) -> Option<InstanceState> {
        self.instance.as_ref().map(|i| i.state)
    }

    /// Creates a pod and starts tracking it.
    ///
    /// A previously tracked instance may only be replaced once it has
    /// settled (terminated or failed).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyTracking`] while a live instance is
    /// tracked, or the backend error; the instance is then `Failed`.
    pub async fn create(&mut self, request: &InstanceRequest) -> Result<InstanceSnapshot> {
        if let Some(existing) = self.instance.as_ref().filter(|i| !i.state.is_terminal()) {
            return Err(LifecycleError::AlreadyTracking {
                id: existing.label().to_string(),
            }
            .into());
        }

        let instance = self.instance.insert(Instance::requested(request));

        match self.backend.create_instance(request).await {
            Ok(snapshot) => {
                instance.id = Some(snapshot.id.clone());
                instance.transition(LifecycleEvent::Created)?;
                info!("Pod {} created ({})", snapshot.id, request.offering_id);
                Ok(snapshot)
            }
            Err(e) => {
                instance.transition(LifecycleEvent::Failure)?;
                Err(e)
            }
        }
    }

    /// Polls until the pod is running and reachable over SSH.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ProvisioningTimeout`] after the polling
    /// ceiling, [`LifecycleError::ProvisioningFailed`] if the pod exits or
    /// disappears, or the backend error that ended polling. In every case
    /// the instance is `Failed`, and unless the pod disappeared a
    /// best-effort termination has been issued.
    pub async fn wait_until_running(&mut self) -> Result<InstanceSnapshot> {
        let id = self.provisioning_id()?;
        let started = Instant::now();
        let deadline = started + self.poll.timeout;
        let mut polls = 0u32;

        info!("Waiting for pod {id} to start");

        loop {
            polls += 1;
            match self.backend.get_instance(&id).await {
                Ok(snapshot) if snapshot.is_ready() => {
                    self.mark_ready(&snapshot)?;
                    info!(
                        "Pod {id} is running at {}:{} after {polls} polls",
                        snapshot.public_ip.as_deref().unwrap_or_default(),
                        snapshot.ssh_port.unwrap_or_default()
                    );
                    return Ok(snapshot);
                }
                Ok(snapshot) if snapshot.status.is_gone() => {
                    self.fail_and_release(&id).await;
                    return Err(LifecycleError::ProvisioningFailed {
                        id,
                        reason: format!("pod reported {}", snapshot.status),
                    }
                    .into());
                }
                Ok(snapshot) => {
                    debug!("Pod {id} is {} (poll {polls})", snapshot.status);
                }
                Err(e) if e.is_not_found() => {
                    self.mark_failed();
                    return Err(LifecycleError::ProvisioningFailed {
                        id,
                        reason: String::from("pod disappeared while provisioning"),
                    }
                    .into());
                }
                Err(e) => {
                    // The backend already spent its retry budget on this poll.
                    error!("Polling pod {id} failed: {e}");
                    self.fail_and_release(&id).await;
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.fail_and_release(&id).await;
                return Err(LifecycleError::ProvisioningTimeout {
                    id,
                    waited_secs: started.elapsed().as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.poll.interval.min(deadline - now)).await;
        }
    }

    /// Terminates the tracked pod.
    ///
    /// Idempotent: once the instance is `Terminated` or `Failed`, further
    /// calls succeed without a backend call.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TerminationFailed`] when the backend call
    /// fails after retries; the instance is then `Failed`.
    pub async fn terminate(&mut self) -> Result<TerminationOutcome> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(TerminationOutcome::NoInstance);
        };

        if instance.state.is_terminal() {
            return Ok(TerminationOutcome::AlreadySettled {
                state: instance.state,
            });
        }

        if instance.state != InstanceState::Terminating {
            instance.transition(LifecycleEvent::StopRequested)?;
        }

        let Some(id) = instance.id.clone() else {
            instance.transition(LifecycleEvent::TerminateConfirmed)?;
            return Ok(TerminationOutcome::AlreadySettled {
                state: instance.state,
            });
        };

        info!("Terminating pod {id}");
        match self.backend.terminate_instance(&id).await {
            Ok(result) => {
                instance.transition(LifecycleEvent::TerminateConfirmed)?;
                Ok(match result {
                    TerminateResult::Terminated => {
                        info!("Pod {id} terminated");
                        TerminationOutcome::Terminated { id }
                    }
                    TerminateResult::AlreadyGone => TerminationOutcome::AlreadyGone { id },
                })
            }
            Err(e) => {
                instance.transition(LifecycleEvent::Failure)?;
                error!("Failed to terminate pod {id}: {e}. You may still be billed for it");
                Err(LifecycleError::TerminationFailed {
                    id,
                    message: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Starts tracking a pod created by an earlier run, so it can be
    /// terminated.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyTracking`] while a live instance is
    /// tracked.
    pub fn adopt(&mut self, snapshot: &InstanceSnapshot) -> Result<()> {
        if let Some(existing) = self.instance.as_ref().filter(|i| !i.state.is_terminal()) {
            return Err(LifecycleError::AlreadyTracking {
                id: existing.label().to_string(),
            }
            .into());
        }

        let mut instance = Instance {
            id: Some(snapshot.id.clone()),
            name: snapshot.name.clone(),
            image: snapshot.image.clone(),
            ports: Vec::new(),
            offering_id: String::new(),
            state: InstanceState::Requested,
            public_ip: snapshot.public_ip.clone(),
            ssh_port: snapshot.ssh_port,
        };
        instance.transition(LifecycleEvent::Created)?;
        if snapshot.is_ready() {
            instance.transition(LifecycleEvent::BecameReady)?;
        }
        self.instance = Some(instance);
        Ok(())
    }

    fn provisioning_id(&self) -> Result<String> {
        let instance = self.instance.as_ref().ok_or(LifecycleError::NoInstance)?;
        match (&instance.id, instance.state) {
            (Some(id), InstanceState::Provisioning) => Ok(id.clone()),
            (_, state) => Err(LifecycleError::InvalidTransition {
                from: state,
                event: LifecycleEvent::BecameReady,
            }
            .into()),
        }
    }

    fn mark_ready(&mut self, snapshot: &InstanceSnapshot) -> Result<()> {
        let instance = self.instance.as_mut().ok_or(LifecycleError::NoInstance)?;
        instance.transition(LifecycleEvent::BecameReady)?;
        instance.public_ip.clone_from(&snapshot.public_ip);
        instance.ssh_port = snapshot.ssh_port;
        Ok(())
    }

    fn mark_failed(&mut self) {
        if let Some(instance) = self.instance.as_mut() {
            if let Err(e) = instance.transition(LifecycleEvent::Failure) {
                debug!("Ignoring failure event: {e}");
            }
        }
    }

    /// Best-effort termination of a half-provisioned pod, then `Failed`.
    async fn fail_and_release(&mut self, id: &str) {
        match self.backend.terminate_instance(id).await {
            Ok(_) => info!("Released pod {id}"),
            Err(e) => error!("Failed to release pod {id}: {e}. You may still be billed for it"),
        }
        self.mark_failed();
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("poll", &self.poll)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}
