//! End-to-end `deploy` and `stop` runs against a scripted backend.

#![cfg(unix)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};

use podlease::capacity::{
    CapacityBackend, GpuOffering, InstanceRequest, InstanceSnapshot, Market, RemoteStatus,
    TerminateResult,
};
use podlease::cleanup::SignalSource;
use podlease::error::{CapacityError, Result, SelectionError, Stage};
use podlease::lifecycle::{PollSettings, TerminationOutcome};
use podlease::orchestrator::{self, DeployPlan, Orchestrator, StopReason};
use podlease::tunnel::{
    kill_and_reap, BindMode, ProcessLauncher, SshAuth, SshCommand, TunnelSettings, TunnelSpec,
};
use podlease::{PodleaseError, Settings};

type Events = Arc<Mutex<Vec<String>>>;

fn offering(id: &str, vram_gb: u32, cost: f64) -> GpuOffering {
    GpuOffering {
        id: id.to_string(),
        display_name: id.to_string(),
        vram_gb,
        on_demand_cost: Some(cost),
        interruptible_cost: Some(cost / 2.0),
        available: 3,
    }
}

fn snapshot(id: &str, name: &str, status: RemoteStatus, ready: bool) -> InstanceSnapshot {
    InstanceSnapshot {
        id: id.to_string(),
        name: name.to_string(),
        status,
        public_ip: ready.then(|| String::from("203.0.113.5")),
        ssh_port: ready.then_some(40022),
        image: String::from("img"),
    }
}

struct FakeBackend {
    offerings: Vec<GpuOffering>,
    sold_out: Vec<String>,
    polls: Mutex<VecDeque<InstanceSnapshot>>,
    instances: Vec<InstanceSnapshot>,
    events: Events,
}

impl FakeBackend {
    fn new(events: &Events) -> Self {
        Self {
            offerings: vec![offering("A", 24, 0.40), offering("B", 16, 0.30)],
            sold_out: Vec::new(),
            polls: Mutex::new(VecDeque::new()),
            instances: Vec::new(),
            events: Arc::clone(events),
        }
    }

    fn ready_after(self, pending: usize) -> Self {
        let mut polls: VecDeque<InstanceSnapshot> = (0..pending)
            .map(|_| snapshot("pod-1", "podlease-x", RemoteStatus::Created, false))
            .collect();
        polls.push_back(snapshot("pod-1", "podlease-x", RemoteStatus::Running, true));
        *self.polls.lock().expect("lock") = polls;
        self
    }

    fn log(&self, event: String) {
        self.events.lock().expect("lock").push(event);
    }
}

#[async_trait]
impl CapacityBackend for FakeBackend {
    async fn list_offerings(&self, _market: Market) -> Result<Vec<GpuOffering>> {
        Ok(self.offerings.clone())
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<InstanceSnapshot> {
        self.log(format!("create:{}", request.offering_id));
        if self.sold_out.contains(&request.offering_id) {
            return Err(CapacityError::CapacityUnavailable {
                offering: request.offering_id.clone(),
                message: String::from("There are no longer any instances available"),
            }
            .into());
        }
        Ok(snapshot("pod-1", &request.name, RemoteStatus::Created, false))
    }

    async fn get_instance(&self, id: &str) -> Result<InstanceSnapshot> {
        self.log(String::from("poll"));
        Ok(self
            .polls
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| snapshot(id, "podlease-x", RemoteStatus::Created, false)))
    }

    async fn terminate_instance(&self, id: &str) -> Result<TerminateResult> {
        self.log(format!("terminate:{id}"));
        Ok(TerminateResult::Terminated)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSnapshot>> {
        Ok(self.instances.clone())
    }
}

struct FakeLauncher {
    events: Events,
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn can_bind(&self, _addr: IpAddr, _port: u16) -> bool {
        true
    }

    fn spawn(&self, command: &SshCommand) -> io::Result<Child> {
        self.events
            .lock()
            .expect("lock")
            .push(format!("spawn:{command}"));
        Command::new("sleep")
            .arg("30")
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    async fn is_listening(&self, _port: u16) -> bool {
        true
    }

    async fn terminate(&self, spec: &TunnelSpec, child: &mut Child, grace: Duration) {
        self.events
            .lock()
            .expect("lock")
            .push(format!("kill:{}", spec.label));
        kill_and_reap(&spec.label, child, grace).await;
    }
}

fn orchestrator(backend: FakeBackend, events: &Events) -> Orchestrator {
    Orchestrator::new(
        Arc::new(backend),
        Arc::new(FakeLauncher {
            events: Arc::clone(events),
        }),
        SshAuth::Password(String::from("secret")),
        PollSettings {
            interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        },
        TunnelSettings {
            settle: Duration::from_millis(20),
            startup_timeout: Duration::from_secs(5),
            reap_grace: Duration::from_secs(1),
        },
    )
}

fn plan() -> DeployPlan {
    let mut settings = Settings::with_api_key("rpa_test");
    settings.min_vram_gb = 16;
    settings.max_cost_per_hour = 0.50;
    settings.tunnels = TunnelSpec::parse_list("8880:8880/api,2222:22").expect("valid");
    DeployPlan::from_settings(&settings, false)
}

fn events_of(events: &Events) -> Vec<String> {
    events.lock().expect("lock").clone()
}

fn position(events: &[String], prefix: &str) -> usize {
    events
        .iter()
        .position(|e| e.starts_with(prefix))
        .unwrap_or_else(|| panic!("no {prefix} event in {events:?}"))
}

#[tokio::test]
async fn test_deploy_then_interrupt_kills_tunnels_before_terminating() {
    let events: Events = Arc::default();
    let orchestrator = orchestrator(FakeBackend::new(&events).ready_after(2), &events);
    let coordinator = orchestrator.coordinator();

    let mut ready = None;
    let outcome = orchestrator
        .deploy(&plan(), |report| {
            ready = Some(report.clone());
            coordinator.trigger(SignalSource::Interrupt);
        })
        .await;

    let report = ready.expect("pod became ready");
    assert_eq!(report.gpu, "B");
    assert_eq!(report.public_ip, "203.0.113.5");
    assert_eq!(report.ssh_port, 40022);
    assert_eq!(report.bind, BindMode::Wildcard);

    assert!(matches!(outcome.reason, StopReason::Interrupted));
    assert_eq!(outcome.cleanup.tunnels_stopped, 2);
    assert_eq!(
        outcome.cleanup.termination,
        Ok(TerminationOutcome::Terminated {
            id: String::from("pod-1")
        })
    );
    assert!(outcome.success());

    let log = events_of(&events);
    assert_eq!(log.iter().filter(|e| *e == "poll").count(), 3);
    assert!(log[position(&log, "spawn:")].contains("-L 0.0.0.0:8880:127.0.0.1:8880"));
    assert!(position(&log, "kill:api") < position(&log, "terminate:pod-1"));
    assert!(position(&log, "kill:ssh") < position(&log, "terminate:pod-1"));
    assert_eq!(log.iter().filter(|e| e.starts_with("terminate:")).count(), 1);
    assert!(!coordinator.forced_exit());
}

#[tokio::test]
async fn test_interrupt_during_provisioning_terminates_the_pod() {
    let events: Events = Arc::default();
    let orchestrator = orchestrator(FakeBackend::new(&events), &events);
    let coordinator = orchestrator.coordinator();

    let trigger = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            coordinator.trigger(SignalSource::Terminate);
        })
    };

    let outcome = orchestrator
        .deploy(&plan(), |_| panic!("pod never becomes ready"))
        .await;
    trigger.await.expect("trigger task");

    assert!(matches!(outcome.reason, StopReason::Interrupted));
    assert_eq!(outcome.cleanup.tunnels_stopped, 0);
    assert!(outcome.cleanup.confirmed());
    assert!(outcome.success());

    let log = events_of(&events);
    assert!(log.contains(&String::from("terminate:pod-1")));
    assert!(!log.iter().any(|e| e.starts_with("spawn:")));
}

#[tokio::test]
async fn test_sold_out_offering_falls_through_to_next() {
    let events: Events = Arc::default();
    let mut backend = FakeBackend::new(&events).ready_after(0);
    backend.sold_out = vec![String::from("B")];
    let orchestrator = orchestrator(backend, &events);
    let coordinator = orchestrator.coordinator();

    let mut gpu = None;
    let outcome = orchestrator
        .deploy(&plan(), |report| {
            gpu = Some(report.gpu.clone());
            coordinator.trigger(SignalSource::Internal);
        })
        .await;

    assert_eq!(gpu.as_deref(), Some("A"));
    assert!(outcome.success());

    let log = events_of(&events);
    assert!(position(&log, "create:B") < position(&log, "create:A"));
}

#[tokio::test]
async fn test_no_candidate_fails_selection_without_creating() {
    let events: Events = Arc::default();
    let orchestrator = orchestrator(FakeBackend::new(&events), &events);

    let mut plan = plan();
    plan.constraint.min_vram_gb = 80;
    let outcome = orchestrator.deploy(&plan, |_| panic!("nothing qualifies")).await;

    let StopReason::Failed(e) = &outcome.reason else {
        panic!("expected failure, got {:?}", outcome.reason);
    };
    assert_eq!(e.stage, Stage::Selection);
    assert!(matches!(
        e.source,
        PodleaseError::Selection(SelectionError::NoCandidate { .. })
    ));
    assert_eq!(outcome.cleanup.termination, Ok(TerminationOutcome::NoInstance));
    assert!(!outcome.success());
    assert!(events_of(&events).is_empty());
}

#[tokio::test]
async fn test_stop_terminates_only_own_live_pods() {
    let events: Events = Arc::default();
    let mut backend = FakeBackend::new(&events);
    backend.instances = vec![
        snapshot("pod-1", "podlease-20250101-120000", RemoteStatus::Running, true),
        snapshot("pod-2", "podlease-20250101-130000", RemoteStatus::Terminated, false),
        snapshot("pod-3", "someone-elses-pod", RemoteStatus::Running, true),
        snapshot("pod-4", "podlease-20250102-090000", RemoteStatus::Created, false),
    ];

    let results = orchestrator::stop_matching(Arc::new(backend), "podlease")
        .await
        .expect("listed");

    let ids: Vec<&str> = results.iter().map(|(pod, _)| pod.id.as_str()).collect();
    assert_eq!(ids, ["pod-1", "pod-4"]);
    assert!(results.iter().all(|(_, outcome)| outcome.is_ok()));
    assert_eq!(
        events_of(&events),
        ["terminate:pod-1", "terminate:pod-4"]
    );
}
