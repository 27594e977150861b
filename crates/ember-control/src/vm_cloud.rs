use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ember_vm::{StartOutcome, StopOutcome, VmEvent, VmState, VmStatus};
use tokio::sync::broadcast;

use crate::agent_client::AgentApi;
use crate::config::VmTimings;
use crate::control_plane::ControlPlane;
use crate::error::ControlPlaneError;
use crate::vm::{self, PendingOp, VmCell, VmController};

/// Controller for a VM owned by a remote control plane.
pub struct CloudVm {
    cp: Arc<dyn ControlPlane>,
    agent: Arc<dyn AgentApi>,
    agent_port: u16,
    timings: VmTimings,
    cell: VmCell,
}

impl CloudVm {
    pub fn new(
        cp: Arc<dyn ControlPlane>,
        agent: Arc<dyn AgentApi>,
        agent_port: u16,
        timings: VmTimings,
    ) -> Self {
        let cell = VmCell::new(Some(cp.instance().clone()));
        Self {
            cp,
            agent,
            agent_port,
            timings,
            cell,
        }
    }

    async fn run_operation(&self, op: PendingOp) -> Result<(), ControlPlaneError> {
        let handle = match op {
            PendingOp::Start => self.cp.start_instance().await?,
            PendingOp::Stop => self.cp.stop_instance().await?,
        };
        self.cp.wait_operation(handle).await
    }
}

#[async_trait]
impl VmController for CloudVm {
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
        let info = match self.cp.get_instance().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, instance = %self.cp.instance(), "vm status query failed");
                return VmState::Unknown;
            }
        };

        let remote = VmState::from_remote(&info.status);
        if remote == VmState::Unknown {
            tracing::warn!(status = %info.status, "unrecognized remote vm status");
        }

        let port = self.agent_port;
        self.cell.update(|c, ev| {
            let next = c.reconcile(remote);
            if next == VmState::Running
                && let Some(ip) = info.internal_ip.as_deref()
                && (c.agent_url.is_none() || !c.url_fresh)
            {
                c.agent_url = Some(format!("http://{ip}:{port}"));
                c.url_fresh = true;
            }
            c.apply_state(next, ev);
            next
        })
    }

    async fn probe_agent(&self) -> bool {
        vm::probe_agent(&self.cell, self.agent.as_ref(), self.timings.probe_timeout).await
    }

    async fn start(&self) -> StartOutcome {
        // Optimistic: concurrent polls must not see "stopped" and start again.
        self.cell.update(|c, ev| {
            c.pending = Some(PendingOp::Start);
            c.url_fresh = false;
            c.apply_state(VmState::Starting, ev);
        });
        tracing::info!(instance = %self.cp.instance(), "starting vm");

        let res = self.run_operation(PendingOp::Start).await;
        self.cell.set_pending(None);

        if let Err(err) = res {
            tracing::error!(%err, "vm start failed");
            self.cell.set_state(VmState::Stopped);
            return StartOutcome::failed(VmState::Stopped, err.to_string());
        }

        let ready = self.wait_for_agent(self.timings.readiness_timeout).await;
        let st = self.cell.snapshot();
        tracing::info!(state = %st.state, ready, "vm start finished");
        StartOutcome::ok(st.state, st.agent_ready)
    }

    async fn stop(&self) -> StopOutcome {
        vm::pre_shutdown(&self.cell, self.agent.as_ref(), self.timings.shutdown_timeout).await;

        self.cell.update(|c, ev| {
            c.pending = Some(PendingOp::Stop);
            c.apply_state(VmState::Stopping, ev);
        });
        tracing::info!(instance = %self.cp.instance(), "stopping vm");

        let res = self.run_operation(PendingOp::Stop).await;
        self.cell.set_pending(None);

        match res {
            Ok(()) => {
                self.cell.set_state(VmState::Stopped);
                tracing::info!("vm stopped");
                StopOutcome {
                    success: true,
                    state: VmState::Stopped,
                    error: None,
                }
            }
            Err(err) => {
                tracing::error!(%err, "vm stop failed");
                self.refresh_status().await;
                vm::stop_failed(&self.cell, err.to_string())
            }
        }
    }

    async fn wait_for_agent(&self, timeout: Duration) -> bool {
        vm::wait_for_agent(self, &self.cell, self.agent.as_ref(), timeout).await
    }
}
