use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use ember_vm::InstanceId;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_AGENT_PORT: u16 = 8081;
const DEFAULT_LOCAL_AGENT_URL: &str = "http://127.0.0.1:8081";
const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 30;
const DEFAULT_WARNING_MINUTES: u64 = 5;
const DEFAULT_PLAYER_POLL_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMode {
    Cloud,
    Local,
}

fn parse_mode(raw: Option<String>) -> VmMode {
    match raw
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "local" | "dev" => VmMode::Local,
        _ => VmMode::Cloud,
    }
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw
        .as_deref()
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_u64(raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    raw.as_deref()
        .unwrap_or_default()
        .trim()
        .parse::<u64>()
        .ok()
        .unwrap_or(default)
        .clamp(min, max)
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Timing knobs of the VM controller. Only the poll interval is exposed through
/// the environment; the rest are the documented defaults.
#[derive(Debug, Clone)]
pub struct VmTimings {
    pub poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub readiness_timeout_running: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub operation_timeout: Duration,
    pub stopping_grace: Duration,
    /// Longest a proxied request waits for the agent's response headers.
    pub proxy_response_timeout: Duration,
}

impl Default for VmTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            readiness_timeout: Duration::from_secs(120),
            readiness_timeout_running: Duration::from_secs(60),
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(35),
            operation_timeout: Duration::from_secs(300),
            stopping_grace: Duration::from_secs(10),
            proxy_response_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InactivityConfig {
    pub enabled: bool,
    pub idle_timeout: Duration,
    pub warning_lead: Duration,
    pub player_poll_interval: Duration,
    pub check_interval: Duration,
    pub player_count_timeout: Duration,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_MINUTES * 60),
            warning_lead: Duration::from_secs(DEFAULT_WARNING_MINUTES * 60),
            player_poll_interval: Duration::from_millis(DEFAULT_PLAYER_POLL_INTERVAL_MS),
            check_interval: Duration::from_secs(30),
            player_count_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub admin_user: String,
    pub admin_pass: String,
    pub admin_pass_hash: Option<String>,
    pub jwt_secret: Vec<u8>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub mode: VmMode,
    pub instance: Option<InstanceId>,
    pub gce_access_token: Option<String>,
    pub agent_port: u16,
    pub local_agent_url: String,
    pub vm: VmTimings,
    pub inactivity: InactivityConfig,
    pub auth: AuthConfig,
}

fn parse_allowed_origins(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_else(|| "http://localhost:5173,http://127.0.0.1:5173".to_string())
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = non_empty(env("EMBER_LISTEN_ADDR"))
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("parse EMBER_LISTEN_ADDR")?;

        let mode = parse_mode(env("EMBER_VM_MODE"));
        let instance = match (
            non_empty(env("EMBER_GCE_PROJECT")),
            non_empty(env("EMBER_GCE_ZONE")),
            non_empty(env("EMBER_GCE_INSTANCE")),
        ) {
            (Some(project), Some(zone), Some(name)) => Some(InstanceId {
                project,
                zone,
                name,
            }),
            _ => None,
        };
        if mode == VmMode::Cloud && instance.is_none() {
            anyhow::bail!(
                "EMBER_GCE_PROJECT, EMBER_GCE_ZONE and EMBER_GCE_INSTANCE are required in cloud mode"
            );
        }

        let agent_port = parse_u64(env("EMBER_AGENT_PORT"), DEFAULT_AGENT_PORT as u64, 1, 65_535);

        let vm = VmTimings {
            poll_interval: Duration::from_millis(parse_u64(
                env("EMBER_VM_POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL_MS,
                1000,
                10 * 60_000,
            )),
            ..VmTimings::default()
        };

        let inactivity = InactivityConfig {
            enabled: parse_bool(env("EMBER_AUTO_SHUTDOWN"), true),
            idle_timeout: Duration::from_secs(
                parse_u64(
                    env("EMBER_IDLE_TIMEOUT_MINUTES"),
                    DEFAULT_IDLE_TIMEOUT_MINUTES,
                    1,
                    24 * 60,
                ) * 60,
            ),
            warning_lead: Duration::from_secs(
                parse_u64(
                    env("EMBER_IDLE_WARNING_MINUTES"),
                    DEFAULT_WARNING_MINUTES,
                    0,
                    24 * 60,
                ) * 60,
            ),
            player_poll_interval: Duration::from_millis(parse_u64(
                env("EMBER_PLAYER_POLL_INTERVAL_MS"),
                DEFAULT_PLAYER_POLL_INTERVAL_MS,
                5_000,
                60 * 60_000,
            )),
            ..InactivityConfig::default()
        };
        if inactivity.warning_lead >= inactivity.idle_timeout {
            anyhow::bail!("EMBER_IDLE_WARNING_MINUTES must be lower than EMBER_IDLE_TIMEOUT_MINUTES");
        }

        let auth = AuthConfig {
            admin_user: non_empty(env("EMBER_ADMIN_USER")).unwrap_or_else(|| "admin".to_string()),
            admin_pass: env("EMBER_ADMIN_PASS").unwrap_or_else(|| "admin".to_string()),
            admin_pass_hash: non_empty(env("EMBER_ADMIN_PASS_HASH")),
            jwt_secret: env("EMBER_JWT_SECRET")
                .unwrap_or_else(|| "dev-insecure-change-me".to_string())
                .into_bytes(),
            allowed_origins: parse_allowed_origins(env("EMBER_ALLOWED_ORIGINS")),
        };

        Ok(Self {
            listen_addr,
            mode,
            instance,
            gce_access_token: non_empty(env("EMBER_GCE_ACCESS_TOKEN")),
            agent_port: agent_port as u16,
            local_agent_url: non_empty(env("EMBER_LOCAL_AGENT_URL"))
                .unwrap_or_else(|| DEFAULT_LOCAL_AGENT_URL.to_string()),
            vm,
            inactivity,
            auth,
        })
    }
}
