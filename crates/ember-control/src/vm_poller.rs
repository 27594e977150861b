use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ember_vm::VmState;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::vm::VmController;

/// Background status refresh. Keeps readiness current outside explicit
/// start calls (agent restarts, VM power-cycled from the cloud console).
pub struct VmPoller {
    vm: Arc<dyn VmController>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VmPoller {
    pub fn new(vm: Arc<dyn VmController>) -> Self {
        Self {
            vm,
            task: Mutex::new(None),
        }
    }

    pub fn start(&self, every: Duration) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let vm = self.vm.clone();
        tracing::info!(interval_ms = every.as_millis() as u64, "vm status polling started");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick(vm.as_ref()).await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
            tracing::info!("vm status polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for VmPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick(vm: &dyn VmController) {
    vm.refresh_status().await;
    if vm.status().state == VmState::Running {
        vm.probe_agent().await;
    }
}
