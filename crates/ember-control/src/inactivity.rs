use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ember_vm::{InactivityEvent, InactivityStatus, VmEvent, VmState};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::agent_client::AgentApi;
use crate::config::InactivityConfig;
use crate::vm::VmController;

#[derive(Debug)]
struct Tracker {
    running: bool,
    /// Bumped on every start/stop; loops from an older epoch are inert.
    epoch: u64,
    last_web: Instant,
    last_player: Instant,
    last_player_count: Option<u32>,
    warning_emitted: bool,
    tasks: Vec<JoinHandle<()>>,
    #[cfg(test)]
    web_records: usize,
}

impl Tracker {
    fn idle(&self, now: Instant) -> (Duration, Duration) {
        (now - self.last_web, now - self.last_player)
    }

    fn halt(&mut self) {
        self.running = false;
        self.epoch += 1;
        for t in self.tasks.drain(..) {
            t.abort();
        }
    }
}

struct Inner {
    vm: Arc<dyn VmController>,
    agent: Arc<dyn AgentApi>,
    cfg: InactivityConfig,
    tracker: Mutex<Tracker>,
    events: broadcast::Sender<InactivityEvent>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, ev: InactivityEvent) {
        let _ = self.events.send(ev);
    }
}

fn minutes(d: Duration) -> u64 {
    d.as_secs() / 60
}

/// Dual-idle auto-shutdown: powers the VM off once both the web panel and the
/// game have been idle for the configured timeout.
#[derive(Clone)]
pub struct InactivityMonitor {
    inner: Arc<Inner>,
}

impl InactivityMonitor {
    pub fn new(
        vm: Arc<dyn VmController>,
        agent: Arc<dyn AgentApi>,
        cfg: InactivityConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                vm,
                agent,
                cfg,
                tracker: Mutex::new(Tracker {
                    running: false,
                    epoch: 0,
                    last_web: now,
                    last_player: now,
                    last_player_count: None,
                    warning_emitted: false,
                    tasks: Vec::new(),
                    #[cfg(test)]
                    web_records: 0,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InactivityEvent> {
        self.inner.events.subscribe()
    }

    pub fn start(&self) {
        let mut t = self.inner.lock();
        if t.running {
            return;
        }
        let now = Instant::now();
        t.running = true;
        t.epoch += 1;
        t.last_web = now;
        t.last_player = now;
        t.warning_emitted = false;

        let epoch = t.epoch;
        let cfg = &self.inner.cfg;
        t.tasks.push(tokio::spawn(check_loop(self.clone(), epoch)));
        t.tasks.push(tokio::spawn(player_loop(self.clone(), epoch)));
        drop(t);

        tracing::info!(
            timeout_minutes = minutes(cfg.idle_timeout),
            warning_minutes = minutes(cfg.warning_lead),
            "inactivity monitor started"
        );
        self.inner.emit(InactivityEvent::Started);
    }

    pub fn stop(&self) {
        let mut t = self.inner.lock();
        if !t.running {
            return;
        }
        t.halt();
        drop(t);
        tracing::info!("inactivity monitor stopped");
        self.inner.emit(InactivityEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn record_web_activity(&self) {
        let mut t = self.inner.lock();
        t.last_web = Instant::now();
        t.warning_emitted = false;
        #[cfg(test)]
        {
            t.web_records += 1;
        }
    }

    pub fn record_player_activity(&self) {
        let mut t = self.inner.lock();
        t.last_player = Instant::now();
        t.warning_emitted = false;
    }

    pub fn status(&self) -> InactivityStatus {
        let timeout = self.inner.cfg.idle_timeout;
        let t = self.inner.lock();
        let (web_idle, player_idle) = t.idle(Instant::now());
        // Shutdown needs both signals idle, so the less idle one bounds it.
        let until = if t.running {
            timeout.saturating_sub(web_idle.min(player_idle))
        } else {
            Duration::ZERO
        };
        InactivityStatus {
            running: t.running,
            timeout_minutes: minutes(timeout),
            web_idle_minutes: minutes(web_idle),
            player_idle_minutes: minutes(player_idle),
            last_player_count: t.last_player_count,
            time_until_shutdown_minutes: until.as_secs().div_ceil(60),
        }
    }

    #[cfg(test)]
    fn warning_emitted(&self) -> bool {
        self.inner.lock().warning_emitted
    }

    #[cfg(test)]
    pub(crate) fn web_records(&self) -> usize {
        self.inner.lock().web_records
    }

    fn check(&self, epoch: u64) {
        if self.inner.vm.status().state != VmState::Running {
            return;
        }

        let cfg = &self.inner.cfg;
        let mut t = self.inner.lock();
        if !t.running || t.epoch != epoch {
            return;
        }

        let (web_idle, player_idle) = t.idle(Instant::now());
        if web_idle >= cfg.idle_timeout && player_idle >= cfg.idle_timeout {
            // Halting here aborts this very loop at its next await; the
            // shutdown itself runs on its own task.
            t.halt();
            drop(t);
            tokio::spawn(shutdown(self.clone(), web_idle, player_idle));
            return;
        }

        let remaining = cfg
            .idle_timeout
            .saturating_sub(web_idle)
            .min(cfg.idle_timeout.saturating_sub(player_idle));
        if !t.warning_emitted && !remaining.is_zero() && remaining <= cfg.warning_lead {
            t.warning_emitted = true;
            let minutes_remaining = remaining.as_secs().div_ceil(60);
            tracing::warn!(
                minutes_remaining,
                web_idle_minutes = minutes(web_idle),
                player_idle_minutes = minutes(player_idle),
                "vm will shut down soon due to inactivity"
            );
            self.inner
                .emit(InactivityEvent::Warning { minutes_remaining });
        }
    }

    async fn poll_players(&self, epoch: u64) {
        let st = self.inner.vm.status();
        if !st.is_ready() {
            return;
        }
        let Some(url) = st.game_agent_url else {
            return;
        };

        let count = match self
            .inner
            .agent
            .player_count(&url, self.inner.cfg.player_count_timeout)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                // Unreachable is neither "empty" nor "active": leave the clock running.
                tracing::debug!(%err, "player count poll failed");
                return;
            }
        };

        let mut t = self.inner.lock();
        if !t.running || t.epoch != epoch {
            return;
        }
        if count > 0 {
            t.last_player = Instant::now();
            t.warning_emitted = false;
        }
        let previous = t.last_player_count;
        t.last_player_count = Some(count);
        drop(t);

        if previous != Some(count) {
            tracing::info!(?previous, current = count, "player count changed");
            self.inner.emit(InactivityEvent::PlayerCountChanged {
                previous,
                current: count,
            });
        }
    }
}

async fn check_loop(monitor: InactivityMonitor, epoch: u64) {
    let every = monitor.inner.cfg.check_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        monitor.check(epoch);
    }
}

async fn player_loop(monitor: InactivityMonitor, epoch: u64) {
    let mut ticker = tokio::time::interval(monitor.inner.cfg.player_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        monitor.poll_players(epoch).await;
    }
}

async fn shutdown(monitor: InactivityMonitor, web_idle: Duration, player_idle: Duration) {
    let inner = &monitor.inner;
    tracing::warn!(
        web_idle_minutes = minutes(web_idle),
        player_idle_minutes = minutes(player_idle),
        "shutting down idle vm"
    );
    inner.emit(InactivityEvent::ShuttingDown {
        web_idle_minutes: minutes(web_idle),
        player_idle_minutes: minutes(player_idle),
    });

    let out = inner.vm.stop().await;
    if out.success {
        tracing::info!("idle shutdown complete");
        inner.emit(InactivityEvent::ShutdownComplete);
        return;
    }

    let message = out.error.unwrap_or_else(|| "vm stop failed".to_string());
    tracing::error!(error = %message, "idle shutdown failed; resuming inactivity checks");
    inner.emit(InactivityEvent::ShutdownError { message });
    monitor.start();
}

/// Runs the monitor only while the VM is up: entering `running` starts it,
/// entering `stopped` stops it.
pub fn spawn_vm_binding(monitor: InactivityMonitor) -> JoinHandle<()> {
    let vm = monitor.inner.vm.clone();
    let mut rx = vm.subscribe();
    if vm.status().state == VmState::Running {
        monitor.start();
    }
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(VmEvent::StateChanged { to, .. }) => match to {
                    VmState::Running => monitor.start(),
                    VmState::Stopped => monitor.stop(),
                    _ => {}
                },
                Ok(VmEvent::AgentReadiness { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "vm event stream lagged");
                    match vm.status().state {
                        VmState::Running => monitor.start(),
                        VmState::Stopped => monitor.stop(),
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
