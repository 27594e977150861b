use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use ember_vm::InstanceId;
use serde::Deserialize;

use crate::error::ControlPlaneError;

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Instance as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub status: String,
    pub internal_ip: Option<String>,
}

/// Handle of a long-running control plane operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub error: Option<String>,
}

/// Power operations of the remote instance. Each call is bounded by the
/// implementation's own timeout.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    fn instance(&self) -> &InstanceId;
    async fn get_instance(&self) -> Result<InstanceInfo, ControlPlaneError>;
    async fn start_instance(&self) -> Result<Operation, ControlPlaneError>;
    async fn stop_instance(&self) -> Result<Operation, ControlPlaneError>;
    /// Resolves once `op` is done; an operation that finished with errors is
    /// reported as `ControlPlaneError::Operation`.
    async fn wait_operation(&self, op: Operation) -> Result<(), ControlPlaneError>;
}

#[derive(Debug, Deserialize)]
struct GceNetworkInterface {
    #[serde(default, rename = "networkIP")]
    network_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    status: String,
    #[serde(default)]
    network_interfaces: Vec<GceNetworkInterface>,
}

#[derive(Debug, Deserialize)]
struct GceOperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GceOperationError {
    #[serde(default)]
    errors: Vec<GceOperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GceOperation {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<GceOperationError>,
}

impl From<GceOperation> for Operation {
    fn from(op: GceOperation) -> Self {
        let error = op.error.and_then(|e| {
            let msg = e
                .errors
                .into_iter()
                .map(|i| {
                    if i.code.is_empty() {
                        i.message
                    } else {
                        format!("{}: {}", i.code, i.message)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            if msg.is_empty() { None } else { Some(msg) }
        });
        Operation {
            done: op.status.eq_ignore_ascii_case("DONE"),
            name: op.name,
            error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Compute Engine REST client for a single instance.
pub struct GceControlPlane {
    http: reqwest::Client,
    instance: InstanceId,
    static_token: Option<String>,
    token_cache: Mutex<Option<CachedToken>>,
    operation_timeout: Duration,
}

impl GceControlPlane {
    pub fn new(
        instance: InstanceId,
        static_token: Option<String>,
        operation_timeout: Duration,
    ) -> Result<Self, ControlPlaneError> {
        let http = reqwest::Client::builder()
            .user_agent("ember-control")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ControlPlaneError::transport)?;
        Ok(Self {
            http,
            instance,
            static_token,
            token_cache: Mutex::new(None),
            operation_timeout,
        })
    }

    fn instance_url(&self) -> String {
        format!(
            "{COMPUTE_BASE}/projects/{}/zones/{}/instances/{}",
            self.instance.project, self.instance.zone, self.instance.name
        )
    }

    fn operation_wait_url(&self, op: &str) -> String {
        format!(
            "{COMPUTE_BASE}/projects/{}/zones/{}/operations/{op}/wait",
            self.instance.project, self.instance.zone
        )
    }

    async fn access_token(&self) -> Result<String, ControlPlaneError> {
        if let Some(t) = &self.static_token {
            return Ok(t.clone());
        }

        // Refresh a minute early so a token never expires mid-request.
        const SKEW: Duration = Duration::from_secs(60);
        if let Some(hit) = self
            .token_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|c| c.expires_at > Instant::now() + SKEW)
            .map(|c| c.token.clone())
        {
            return Ok(hit);
        }

        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ControlPlaneError::Auth(format!("metadata server: {e}")))?;
        if !resp.status().is_success() {
            return Err(ControlPlaneError::Auth(format!(
                "metadata server returned {}",
                resp.status()
            )));
        }
        let tok = resp
            .json::<MetadataToken>()
            .await
            .map_err(|e| ControlPlaneError::Auth(format!("parse metadata token: {e}")))?;

        *self.token_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedToken {
            token: tok.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(tok.expires_in.max(60)),
        });
        Ok(tok.access_token)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ControlPlaneError> {
        let token = self.access_token().await?;
        let resp = req
            .bearer_auth(token)
            .send()
            .await
            .map_err(ControlPlaneError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        resp.json::<T>().await.map_err(ControlPlaneError::transport)
    }

    async fn post_operation(&self, verb: &str) -> Result<Operation, ControlPlaneError> {
        let url = format!("{}/{verb}", self.instance_url());
        let op: GceOperation = self.send_json(self.http.post(url)).await?;
        tracing::debug!(op = %op.name, verb, "control plane operation submitted");
        Ok(op.into())
    }
}

#[async_trait]
impl ControlPlane for GceControlPlane {
    fn instance(&self) -> &InstanceId {
        &self.instance
    }

    async fn get_instance(&self) -> Result<InstanceInfo, ControlPlaneError> {
        let inst: GceInstance = self.send_json(self.http.get(self.instance_url())).await?;
        let internal_ip = inst
            .network_interfaces
            .into_iter()
            .find_map(|n| n.network_ip.filter(|ip| !ip.is_empty()));
        Ok(InstanceInfo {
            status: inst.status,
            internal_ip,
        })
    }

    async fn start_instance(&self) -> Result<Operation, ControlPlaneError> {
        self.post_operation("start").await
    }

    async fn stop_instance(&self) -> Result<Operation, ControlPlaneError> {
        self.post_operation("stop").await
    }

    async fn wait_operation(&self, op: Operation) -> Result<(), ControlPlaneError> {
        let wait = async {
            let mut op = op;
            // `operations.wait` returns after at most ~2 minutes even when the
            // operation is still running, so keep asking until it reports DONE.
            while !op.done {
                let next: GceOperation = self
                    .send_json(
                        self.http
                            .post(self.operation_wait_url(&op.name))
                            .timeout(Duration::from_secs(150)),
                    )
                    .await?;
                op = next.into();
            }
            match op.error {
                Some(message) => Err(ControlPlaneError::Operation {
                    name: op.name,
                    message,
                }),
                None => Ok(()),
            }
        };

        tokio::time::timeout(self.operation_timeout, wait)
            .await
            .map_err(|_| ControlPlaneError::Timeout("control plane operation"))?
    }
}
