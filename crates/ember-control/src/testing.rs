//! In-process fakes for the control plane, the agent and the VM controller.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ember_vm::{InstanceId, StartOutcome, StopOutcome, VmEvent, VmState, VmStatus};
use tokio::sync::broadcast;

use crate::agent_client::AgentApi;
use crate::config::{AuthConfig, VmTimings};
use crate::control_plane::{ControlPlane, InstanceInfo, Operation};
use crate::error::{AgentError, ControlPlaneError};
use crate::vm::{VmCell, VmController};

pub fn auth_config() -> AuthConfig {
    AuthConfig {
        admin_user: "admin".into(),
        admin_pass: "hunter2".into(),
        admin_pass_hash: None,
        jwt_secret: b"test-secret".to_vec(),
        allowed_origins: vec!["http://localhost:5173".into()],
    }
}

pub fn assert_ready_invariant(st: &VmStatus) {
    assert!(
        !st.agent_ready || st.state == VmState::Running,
        "agent ready while vm is {}",
        st.state
    );
}

pub struct FakeControlPlane {
    instance: InstanceId,
    remote: Mutex<(String, String)>,
    pub fail_status: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeControlPlane {
    fn with(status: &str, ip: &str) -> Arc<Self> {
        Arc::new(Self {
            instance: InstanceId {
                project: "proj".into(),
                zone: "zone-a".into(),
                name: "mc".into(),
            },
            remote: Mutex::new((status.to_string(), ip.to_string())),
            fail_status: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn running(ip: &str) -> Arc<Self> {
        Self::with("RUNNING", ip)
    }

    pub fn stopped(ip: &str) -> Arc<Self> {
        Self::with("TERMINATED", ip)
    }

    pub fn set_remote(&self, status: &str) {
        self.remote.lock().unwrap().0 = status.to_string();
    }

    pub fn set_ip(&self, ip: &str) {
        self.remote.lock().unwrap().1 = ip.to_string();
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    fn instance(&self) -> &InstanceId {
        &self.instance
    }

    async fn get_instance(&self) -> Result<InstanceInfo, ControlPlaneError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Transport("connection refused".into()));
        }
        let (status, ip) = self.remote.lock().unwrap().clone();
        Ok(InstanceInfo {
            internal_ip: (status == "RUNNING").then_some(ip),
            status,
        })
    }

    async fn start_instance(&self) -> Result<Operation, ControlPlaneError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Operation {
                name: "op-start".into(),
                message: "QUOTA_EXCEEDED: quota exceeded".into(),
            });
        }
        self.set_remote("RUNNING");
        Ok(Operation {
            name: "op-start".into(),
            done: true,
            error: None,
        })
    }

    async fn stop_instance(&self) -> Result<Operation, ControlPlaneError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Api {
                status: 403,
                message: "permission denied".into(),
            });
        }
        self.set_remote("TERMINATED");
        Ok(Operation {
            name: "op-stop".into(),
            done: true,
            error: None,
        })
    }

    async fn wait_operation(&self, op: Operation) -> Result<(), ControlPlaneError> {
        match op.error {
            Some(message) => Err(ControlPlaneError::Operation {
                name: op.name,
                message,
            }),
            None => Ok(()),
        }
    }
}

pub struct FakeAgent {
    pub healthy: AtomicBool,
    pub fail_shutdown: AtomicBool,
    /// `None` makes the player-count call fail like an unreachable agent.
    pub players: Mutex<Option<u32>>,
    pub shutdowns: AtomicUsize,
    pub player_polls: AtomicUsize,
}

impl FakeAgent {
    fn with(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            fail_shutdown: AtomicBool::new(false),
            players: Mutex::new(Some(0)),
            shutdowns: AtomicUsize::new(0),
            player_polls: AtomicUsize::new(0),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::with(true)
    }

    pub fn down() -> Arc<Self> {
        Self::with(false)
    }

    pub fn set_players(&self, count: Option<u32>) {
        *self.players.lock().unwrap() = count;
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn health(&self, _base_url: &str, _timeout: Duration) -> Result<(), AgentError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::Transport("connection refused".into()))
        }
    }

    async fn player_count(&self, _base_url: &str, _timeout: Duration) -> Result<u32, AgentError> {
        self.player_polls.fetch_add(1, Ordering::SeqCst);
        let players = *self.players.lock().unwrap();
        players.ok_or_else(|| AgentError::Transport("timed out".into()))
    }

    async fn shutdown(&self, _base_url: &str, _timeout: Duration) -> Result<(), AgentError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(AgentError::Status(500));
        }
        Ok(())
    }
}

/// Scriptable controller: state is set directly, start/stop only count calls.
pub struct FakeVm {
    cell: VmCell,
    timings: VmTimings,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_stops: AtomicU32,
    pub start_delay: Mutex<Duration>,
}

impl FakeVm {
    pub fn new(state: VmState, ready: bool, url: &str) -> Arc<Self> {
        Self::with_timings(state, ready, url, VmTimings::default())
    }

    pub fn with_timings(state: VmState, ready: bool, url: &str, timings: VmTimings) -> Arc<Self> {
        let vm = Arc::new(Self {
            cell: VmCell::new(None),
            timings,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_stops: AtomicU32::new(0),
            start_delay: Mutex::new(Duration::ZERO),
        });
        vm.set(state, ready);
        vm.cell.update(|c, _| {
            c.agent_url = Some(url.to_string());
            c.url_fresh = true;
        });
        vm
    }

    pub fn set(&self, state: VmState, ready: bool) {
        self.cell.update(|c, ev| {
            c.apply_state(state, ev);
            c.apply_ready(ready, ev);
        });
    }
}

#[async_trait]
impl VmController for FakeVm {
    fn status(&self) -> VmStatus {
        self.cell.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.cell.subscribe()
    }

    fn timings(&self) -> &VmTimings {
        &self.timings
    }

    async fn refresh_status(&self) -> VmState {
        self.cell.snapshot().state
    }

    async fn probe_agent(&self) -> bool {
        self.cell.snapshot().agent_ready
    }

    async fn start(&self) -> StartOutcome {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.cell.set_state(VmState::Starting);
        let delay = *self.start_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.set(VmState::Running, true);
        StartOutcome::ok(VmState::Running, true)
    }

    async fn stop(&self) -> StopOutcome {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_stops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return StopOutcome {
                success: false,
                state: self.cell.snapshot().state,
                error: Some("permission denied".into()),
            };
        }
        self.cell.set_state(VmState::Stopped);
        StopOutcome {
            success: true,
            state: VmState::Stopped,
            error: None,
        }
    }

    async fn wait_for_agent(&self, _timeout: Duration) -> bool {
        self.cell.snapshot().agent_ready
    }
}
