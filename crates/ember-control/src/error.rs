/// Failures talking to the compute control plane.
///
/// Everything except `Operation` is a transport-class failure: the caller keeps
/// its last known state and retries on the next tick.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane unreachable: {0}")]
    Transport(String),
    #[error("control plane returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("access token unavailable: {0}")]
    Auth(String),
}

impl ControlPlaneError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failures talking to the in-VM agent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Transport(String),
    #[error("agent returned {0}")]
    Status(u16),
    #[error("invalid agent response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return AgentError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return AgentError::Status(status.as_u16());
        }
        AgentError::Transport(err.to_string())
    }
}
