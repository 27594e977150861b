use std::time::Duration;

use async_trait::async_trait;

use crate::error::AgentError;

#[derive(Debug, serde::Deserialize)]
struct PlayerCountResponse {
    count: u32,
}

/// HTTP surface of the in-VM agent. Every call takes an explicit timeout so a
/// hung agent cannot stall the loop that issued it.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// `GET /health`; any 2xx means ready.
    async fn health(&self, base_url: &str, timeout: Duration) -> Result<(), AgentError>;
    /// `GET /player-count`.
    async fn player_count(&self, base_url: &str, timeout: Duration) -> Result<u32, AgentError>;
    /// `POST /shutdown`, the graceful hook run before power-off.
    async fn shutdown(&self, base_url: &str, timeout: Duration) -> Result<(), AgentError>;
}

#[derive(Clone)]
pub struct HttpAgent {
    http: reqwest::Client,
}

impl HttpAgent {
    pub fn new() -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .user_agent("ember-control")
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

fn url(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

#[async_trait]
impl AgentApi for HttpAgent {
    async fn health(&self, base_url: &str, timeout: Duration) -> Result<(), AgentError> {
        self.http
            .get(url(base_url, "/health"))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn player_count(&self, base_url: &str, timeout: Duration) -> Result<u32, AgentError> {
        let resp = self
            .http
            .get(url(base_url, "/player-count"))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<PlayerCountResponse>()
            .await?;
        Ok(resp.count)
    }

    async fn shutdown(&self, base_url: &str, timeout: Duration) -> Result<(), AgentError> {
        self.http
            .post(url(base_url, "/shutdown"))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        assert_eq!(url("http://10.0.0.2:8081/", "/health"), "http://10.0.0.2:8081/health");
        assert_eq!(url("http://10.0.0.2:8081", "/shutdown"), "http://10.0.0.2:8081/shutdown");
    }

    #[test]
    fn player_count_payload_parses() {
        let v: PlayerCountResponse = serde_json::from_str(r#"{"count": 3}"#).unwrap();
        assert_eq!(v.count, 3);
    }
}
