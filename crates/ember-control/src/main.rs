use std::sync::Arc;

use ember_control::agent_client::{AgentApi, HttpAgent};
use ember_control::app;
use ember_control::config::{Config, VmMode};
use ember_control::control_plane::GceControlPlane;
use ember_control::inactivity::{self, InactivityMonitor};
use ember_control::state::AppState;
use ember_control::vm::VmController;
use ember_control::vm_cloud::CloudVm;
use ember_control::vm_local::LocalVm;
use ember_control::vm_poller::VmPoller;

fn build_vm(cfg: &Config, agent: Arc<dyn AgentApi>) -> anyhow::Result<Arc<dyn VmController>> {
    match cfg.mode {
        VmMode::Cloud => {
            let instance = cfg
                .instance
                .clone()
                .ok_or_else(|| anyhow::anyhow!("cloud mode requires an instance"))?;
            tracing::info!(%instance, agent_port = cfg.agent_port, "using cloud vm");
            let cp = GceControlPlane::new(
                instance,
                cfg.gce_access_token.clone(),
                cfg.vm.operation_timeout,
            )?;
            Ok(Arc::new(CloudVm::new(
                Arc::new(cp),
                agent,
                cfg.agent_port,
                cfg.vm.clone(),
            )))
        }
        VmMode::Local => {
            tracing::info!(agent_url = %cfg.local_agent_url, "using local development vm");
            Ok(Arc::new(LocalVm::new(
                agent,
                cfg.local_agent_url.clone(),
                cfg.vm.clone(),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env()?;
    let agent: Arc<dyn AgentApi> = Arc::new(HttpAgent::new()?);
    let vm = build_vm(&cfg, agent.clone())?;

    // Learn the real state before serving so the first requests are gated correctly.
    let initial = vm.refresh_status().await;
    if vm.status().state == ember_vm::VmState::Running {
        vm.probe_agent().await;
    }
    tracing::info!(state = %initial, agent_ready = vm.status().agent_ready, "initial vm status");

    let poller = VmPoller::new(vm.clone());
    poller.start(cfg.vm.poll_interval);

    let monitor = if cfg.inactivity.enabled {
        let monitor = InactivityMonitor::new(vm.clone(), agent.clone(), cfg.inactivity.clone());
        inactivity::spawn_vm_binding(monitor.clone());
        Some(monitor)
    } else {
        tracing::info!("auto-shutdown disabled");
        None
    };

    let state = AppState::new(vm, monitor, cfg.auth.clone())?;
    let app = app::router(state);

    let addr = cfg.listen_addr;
    tracing::info!(%addr, "ember-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    poller.stop();
    Ok(())
}
