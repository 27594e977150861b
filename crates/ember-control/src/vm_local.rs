use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ember_vm::{StartOutcome, StopOutcome, VmEvent, VmState, VmStatus};
use tokio::sync::broadcast;

use crate::agent_client::AgentApi;
use crate::config::VmTimings;
use crate::vm::{self, VmCell, VmController};

/// Development stand-in: the "VM" is whatever agent listens on a fixed URL.
///
/// Start and stop only flip a power flag; readiness still comes from real
/// health probes so the gate behaves the same as in the cloud.
pub struct LocalVm {
    agent: Arc<dyn AgentApi>,
    timings: VmTimings,
    powered: AtomicBool,
    cell: VmCell,
}

impl LocalVm {
    pub fn new(agent: Arc<dyn AgentApi>, agent_url: String, timings: VmTimings) -> Self {
        let cell = VmCell::new(None);
        cell.update(|c, _| {
            c.agent_url = Some(agent_url);
            c.url_fresh = true;
        });
        Self {
            agent,
            timings,
            powered: AtomicBool::new(true),
            cell,
        }
    }
}

#[async_trait]
impl VmController for LocalVm {
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
        let state = if self.powered.load(Ordering::SeqCst) {
            VmState::Running
        } else {
            VmState::Stopped
        };
        self.cell.set_state(state);
        state
    }

    async fn probe_agent(&self) -> bool {
        vm::probe_agent(&self.cell, self.agent.as_ref(), self.timings.probe_timeout).await
    }

    async fn start(&self) -> StartOutcome {
        tracing::info!("starting local vm");
        self.powered.store(true, Ordering::SeqCst);
        self.cell.set_state(VmState::Starting);
        let ready = self.wait_for_agent(self.timings.readiness_timeout).await;
        let st = self.cell.snapshot();
        tracing::info!(ready, "local vm start finished");
        StartOutcome::ok(st.state, st.agent_ready)
    }

    async fn stop(&self) -> StopOutcome {
        vm::pre_shutdown(&self.cell, self.agent.as_ref(), self.timings.shutdown_timeout).await;
        self.cell.set_state(VmState::Stopping);
        self.powered.store(false, Ordering::SeqCst);
        self.cell.set_state(VmState::Stopped);
        tracing::info!("local vm stopped");
        StopOutcome {
            success: true,
            state: VmState::Stopped,
            error: None,
        }
    }

    async fn wait_for_agent(&self, timeout: Duration) -> bool {
        vm::wait_for_agent(self, &self.cell, self.agent.as_ref(), timeout).await
    }
}
