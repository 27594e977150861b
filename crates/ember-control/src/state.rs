use std::sync::Arc;

use crate::config::AuthConfig;
use crate::gate::StartTrigger;
use crate::inactivity::InactivityMonitor;
use crate::vm::VmController;

#[derive(Clone)]
pub struct AppState {
    pub vm: Arc<dyn VmController>,
    /// Absent when auto-shutdown is disabled.
    pub monitor: Option<InactivityMonitor>,
    pub proxy: reqwest::Client,
    pub starter: StartTrigger,
    pub auth: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(
        vm: Arc<dyn VmController>,
        monitor: Option<InactivityMonitor>,
        auth: AuthConfig,
    ) -> anyhow::Result<Self> {
        // No overall timeout: console streams and uploads can run long.
        let proxy = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            vm,
            monitor,
            proxy,
            starter: StartTrigger::default(),
            auth: Arc::new(auth),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        vm: Arc<crate::testing::FakeVm>,
        monitor: Option<InactivityMonitor>,
    ) -> Self {
        Self::new(vm, monitor, crate::testing::auth_config())
            .expect("proxy client builds in tests")
    }
}
