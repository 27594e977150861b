use specta::Type;

/// Power state of the remote game VM as seen by the control process.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl VmState {
    /// Maps a Compute Engine instance status string into the local model.
    ///
    /// Suspended instances count as stopped: they hold no running workload and
    /// must be started again before the agent can answer.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => VmState::Running,
            "STOPPED" | "TERMINATED" | "SUSPENDED" => VmState::Stopped,
            "PROVISIONING" | "STAGING" => VmState::Starting,
            "STOPPING" | "SUSPENDING" => VmState::Stopping,
            _ => VmState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Unknown => "unknown",
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque control-plane key of the instance (project/zone/name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceId {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Snapshot of the VM controller, read by the gate, the monitor and the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    pub state: VmState,
    pub agent_ready: bool,
    pub game_agent_url: Option<String>,
    pub instance: Option<InstanceId>,
}

impl VmStatus {
    pub fn is_ready(&self) -> bool {
        self.state == VmState::Running && self.agent_ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub success: bool,
    pub state: VmState,
    pub agent_ready: bool,
    pub error: Option<String>,
}

impl StartOutcome {
    pub fn ok(state: VmState, agent_ready: bool) -> Self {
        Self {
            success: true,
            state,
            agent_ready,
            error: None,
        }
    }

    pub fn failed(state: VmState, error: impl Into<String>) -> Self {
        Self {
            success: false,
            state,
            agent_ready: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub success: bool,
    pub state: VmState,
    pub error: Option<String>,
}

/// State-change notifications published by a VM controller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmEvent {
    StateChanged { from: VmState, to: VmState },
    AgentReadiness { ready: bool },
}

/// Notifications published by the inactivity monitor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InactivityEvent {
    Started,
    Stopped,
    Warning {
        minutes_remaining: u64,
    },
    PlayerCountChanged {
        previous: Option<u32>,
        current: u32,
    },
    ShuttingDown {
        web_idle_minutes: u64,
        player_idle_minutes: u64,
    },
    ShutdownComplete,
    ShutdownError {
        message: String,
    },
}

/// Read-only view of the inactivity monitor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct InactivityStatus {
    pub running: bool,
    pub timeout_minutes: u64,
    pub web_idle_minutes: u64,
    pub player_idle_minutes: u64,
    pub last_player_count: Option<u32>,
    pub time_until_shutdown_minutes: u64,
}

/// 503 body returned by the gate while the agent cannot take requests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct NotReadyBody {
    pub error: String,
    pub vm_status: VmState,
    pub message: String,
    pub retry_after_ms: u64,
}

/// 502 body returned when forwarding to the agent fails mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct ProxyErrorBody {
    pub error: String,
    pub vm_status: VmState,
    pub agent_ready: bool,
}
