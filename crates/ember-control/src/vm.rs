use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use ember_vm::{InstanceId, StartOutcome, StopOutcome, VmEvent, VmState, VmStatus};
use tokio::{sync::broadcast, time::Instant};

use crate::agent_client::AgentApi;
use crate::config::VmTimings;

/// Power lifecycle of the game VM plus readiness of the agent inside it.
///
/// Two implementations exist: [`crate::vm_cloud::CloudVm`] drives a Compute
/// Engine instance, [`crate::vm_local::LocalVm`] treats a locally running agent
/// as an always-present VM for development. Neither method ever panics or
/// returns a transport error to the caller; failures are folded into the
/// returned state.
#[async_trait]
pub trait VmController: Send + Sync {
    /// Latest known snapshot. Never performs I/O.
    fn status(&self) -> VmStatus;

    fn subscribe(&self) -> broadcast::Receiver<VmEvent>;

    fn timings(&self) -> &VmTimings;

    /// Queries the remote side and returns the mapped state. Transport
    /// failures yield `Unknown` and leave the cached state untouched.
    async fn refresh_status(&self) -> VmState;

    /// Probes the agent health endpoint if the VM is running and updates the
    /// readiness flag. Returns the resulting readiness.
    async fn probe_agent(&self) -> bool;

    async fn start(&self) -> StartOutcome;

    async fn stop(&self) -> StopOutcome;

    async fn wait_for_agent(&self, timeout: Duration) -> bool;

    /// Idempotent "make it usable" entry point used by the gate and the UI.
    async fn ensure_running(&self) -> StartOutcome {
        let st = self.status();
        match st.state {
            VmState::Running if st.agent_ready => StartOutcome::ok(VmState::Running, true),
            VmState::Running => {
                let timeout = self.timings().readiness_timeout_running;
                self.wait_for_agent(timeout).await;
                outcome_from(self.status())
            }
            VmState::Starting => {
                let timeout = self.timings().readiness_timeout;
                self.wait_for_agent(timeout).await;
                outcome_from(self.status())
            }
            VmState::Stopping => {
                let grace = self.timings().stopping_grace;
                tracing::info!(
                    grace_secs = grace.as_secs(),
                    "vm is stopping; waiting before starting it again"
                );
                tokio::time::sleep(grace).await;
                self.start().await
            }
            VmState::Stopped | VmState::Unknown => self.start().await,
        }
    }
}

fn outcome_from(st: VmStatus) -> StartOutcome {
    if st.state == VmState::Running {
        StartOutcome::ok(st.state, st.agent_ready)
    } else {
        StartOutcome::failed(st.state, format!("vm is {} after waiting for the agent", st.state))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Start,
    Stop,
}

#[derive(Debug, Default)]
pub(crate) struct Cell {
    pub state: VmState,
    pub agent_ready: bool,
    pub agent_url: Option<String>,
    /// Cached URL was confirmed by a status poll after the last start.
    pub url_fresh: bool,
    pub pending: Option<PendingOp>,
    /// Bumped each time the VM enters running.
    pub run_epoch: u64,
}

impl Cell {
    pub fn apply_state(&mut self, to: VmState, events: &mut Vec<VmEvent>) {
        // Readiness drops before the state leaves running, so a subscriber
        // replaying events never sees ready outside running.
        if to != VmState::Running && self.agent_ready {
            self.agent_ready = false;
            events.push(VmEvent::AgentReadiness { ready: false });
        }
        if self.state != to {
            if to == VmState::Running {
                self.run_epoch += 1;
            }
            events.push(VmEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    pub fn apply_ready(&mut self, ready: bool, events: &mut Vec<VmEvent>) -> bool {
        let ready = ready && self.state == VmState::Running;
        if self.agent_ready != ready {
            self.agent_ready = ready;
            events.push(VmEvent::AgentReadiness { ready });
        }
        self.agent_ready
    }

    /// A remote status that contradicts an in-flight operation is a leftover
    /// from before the operation registered; keep the optimistic state.
    pub fn reconcile(&self, remote: VmState) -> VmState {
        match (self.pending, remote) {
            (Some(PendingOp::Start), VmState::Stopped) => self.state,
            (Some(PendingOp::Stop), VmState::Running) => self.state,
            _ => remote,
        }
    }
}

/// State shared by the controller implementations. The controller is its only
/// writer; everything else reads snapshots.
pub(crate) struct VmCell {
    inner: Mutex<Cell>,
    events: broadcast::Sender<VmEvent>,
    instance: Option<InstanceId>,
}

impl VmCell {
    pub fn new(instance: Option<InstanceId>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Cell::default()),
            events,
            instance,
        }
    }

    pub fn snapshot(&self) -> VmStatus {
        let c = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        VmStatus {
            state: c.state,
            agent_ready: c.agent_ready,
            game_agent_url: c.agent_url.clone().filter(|_| c.url_fresh),
            instance: self.instance.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.events.subscribe()
    }

    /// Runs `f` under the lock, then logs and publishes whatever events it
    /// produced once the lock is released.
    pub fn update<R>(&self, f: impl FnOnce(&mut Cell, &mut Vec<VmEvent>) -> R) -> R {
        let mut events = Vec::new();
        let out = {
            let mut c = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut c, &mut events)
        };
        for ev in events {
            match &ev {
                VmEvent::StateChanged { from, to } => {
                    tracing::info!(%from, %to, "vm state changed");
                }
                VmEvent::AgentReadiness { ready } => {
                    tracing::info!(ready, "agent readiness changed");
                }
            }
            // No subscribers is fine.
            let _ = self.events.send(ev);
        }
        out
    }

    pub fn set_state(&self, to: VmState) {
        self.update(|c, ev| c.apply_state(to, ev));
    }

    pub fn set_ready(&self, ready: bool) -> bool {
        self.update(|c, ev| c.apply_ready(ready, ev))
    }

    pub fn set_pending(&self, pending: Option<PendingOp>) {
        self.update(|c, _| c.pending = pending);
    }

    /// URL and run epoch a health probe should target, if any.
    pub fn probe_target(&self) -> Option<ProbeTarget> {
        let c = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if c.state != VmState::Running || !c.url_fresh {
            return None;
        }
        c.agent_url.clone().map(|url| ProbeTarget {
            url,
            run_epoch: c.run_epoch,
        })
    }

    /// Applies a probe result unless the VM was restarted or its address
    /// changed while the probe was in flight.
    pub fn apply_probe(&self, target: &ProbeTarget, ready: bool) -> bool {
        self.update(|c, ev| {
            let current = c.run_epoch == target.run_epoch
                && c.url_fresh
                && c.agent_url.as_deref() == Some(target.url.as_str());
            if !current {
                tracing::debug!(url = %target.url, "discarding stale agent probe result");
                return c.agent_ready;
            }
            c.apply_ready(ready, ev)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeTarget {
    pub url: String,
    pub run_epoch: u64,
}

/// One health probe against the current agent URL.
pub(crate) async fn probe_agent(cell: &VmCell, agent: &dyn AgentApi, timeout: Duration) -> bool {
    let Some(target) = cell.probe_target() else {
        return cell.set_ready(false);
    };
    match agent.health(&target.url, timeout).await {
        Ok(()) => cell.apply_probe(&target, true),
        Err(err) => {
            tracing::debug!(%err, url = %target.url, "agent health probe failed");
            cell.apply_probe(&target, false)
        }
    }
}

/// Bounded readiness wait shared by both controllers.
pub(crate) async fn wait_for_agent<V>(
    vm: &V,
    cell: &VmCell,
    agent: &dyn AgentApi,
    timeout: Duration,
) -> bool
where
    V: VmController + ?Sized,
{
    let timings = vm.timings();
    let deadline = Instant::now() + timeout;
    vm.refresh_status().await;

    loop {
        let st = cell.snapshot();
        if st.is_ready() {
            return true;
        }

        let starting = cell.update(|c, _| c.pending == Some(PendingOp::Start));
        if matches!(st.state, VmState::Stopped | VmState::Stopping) && !starting {
            tracing::info!(state = %st.state, "vm is not coming up; giving up on agent wait");
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if st.state == VmState::Running && st.game_agent_url.is_some() {
            let probe_timeout = timings.probe_timeout.min(deadline - now);
            if probe_agent(cell, agent, probe_timeout).await {
                tracing::info!("agent is ready");
                return true;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(timings.probe_interval.min(deadline - now)).await;

        let st = cell.snapshot();
        if st.state != VmState::Running || st.game_agent_url.is_none() {
            vm.refresh_status().await;
        }
    }

    tracing::warn!(timeout_secs = timeout.as_secs(), "agent did not become ready in time");
    false
}

/// Best-effort graceful pre-shutdown. Never blocks power-off on failure.
pub(crate) async fn pre_shutdown(cell: &VmCell, agent: &dyn AgentApi, timeout: Duration) {
    let st = cell.snapshot();
    if !st.agent_ready {
        return;
    }
    let Some(url) = st.game_agent_url else {
        return;
    };
    tracing::info!(%url, "asking agent to stop the game server");
    match agent.shutdown(&url, timeout).await {
        Ok(()) => tracing::info!("agent finished graceful shutdown"),
        Err(err) => tracing::warn!(%err, "graceful agent shutdown failed; powering off anyway"),
    }
}

/// Stop outcome built from the cell after a failed stop.
pub(crate) fn stop_failed(cell: &VmCell, error: impl Into<String>) -> StopOutcome {
    StopOutcome {
        success: false,
        state: cell.snapshot().state,
        error: Some(error.into()),
    }
}
