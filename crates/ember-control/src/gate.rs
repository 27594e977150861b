use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Json,
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ember_vm::{NotReadyBody, ProxyErrorBody, VmState, VmStatus};
use futures_util::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::{ACCESS_COOKIE_NAME, CSRF_COOKIE_NAME};
use crate::security::CSRF_HEADER_NAME;
use crate::state::AppState;
use crate::vm::VmController;

pub const API_PREFIX: &str = "/api";
pub const PROXIED_HEADER: &str = "x-ember-proxied";

/// Served by this process even though they sit under the API prefix.
const LOCAL_PREFIXES: &[&str] = &["/api/auth", "/api/vm"];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

// Panel credentials stay with the panel.
const PANEL_COOKIES: &[&str] = &[ACCESS_COOKIE_NAME, CSRF_COOKIE_NAME];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Outside the API prefix (health, static assets).
    Passthrough,
    Local,
    Proxied,
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn classify(path: &str) -> RouteClass {
    if !under(path, API_PREFIX) {
        return RouteClass::Passthrough;
    }
    if LOCAL_PREFIXES.iter().any(|p| under(path, p)) {
        return RouteClass::Local;
    }
    RouteClass::Proxied
}

/// What the gate answers when the agent cannot take the request, plus whether
/// a VM start should be requested.
pub fn not_ready(status: &VmStatus) -> Option<(NotReadyBody, bool)> {
    let (message, retry_after_ms, want_start) = match status.state {
        VmState::Running if status.agent_ready => return None,
        VmState::Running => ("Server is up, waiting for the game agent to respond", 3_000, false),
        VmState::Starting => ("Server is starting", 5_000, false),
        VmState::Stopped | VmState::Unknown => {
            ("Server was stopped; starting it now", 10_000, true)
        }
        VmState::Stopping => ("Server is shutting down; try again shortly", 15_000, false),
    };
    Some((
        NotReadyBody {
            error: "vm_not_ready".to_string(),
            vm_status: status.state,
            message: message.to_string(),
            retry_after_ms,
        },
        want_start,
    ))
}

/// Single-flight VM start shared by the gate and the start endpoint.
#[derive(Clone, Default)]
pub struct StartTrigger {
    in_flight: Arc<AtomicBool>,
}

impl StartTrigger {
    /// Spawns `ensure_running` unless one is already running. Returns whether
    /// this call started it.
    pub fn fire(&self, vm: Arc<dyn VmController>) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let flag = self.in_flight.clone();
        tokio::spawn(async move {
            let out = vm.ensure_running().await;
            if out.success {
                tracing::info!(state = %out.state, agent_ready = out.agent_ready, "vm start request finished");
            } else {
                tracing::warn!(error = ?out.error, "vm start request failed");
            }
            flag.store(false, Ordering::Release);
        });
        true
    }
}

fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Cookie header without the panel's own session and CSRF cookies. `None`
/// when nothing else is left.
fn agent_cookie_header(raw: &str) -> Option<String> {
    let kept: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default().trim();
            !PANEL_COOKIES.contains(&name)
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

fn request_headers(src: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    copy_headers(src, &mut headers);
    headers.remove(CSRF_HEADER_NAME);
    headers.remove(header::COOKIE);
    let cookies = src
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(agent_cookie_header)
        .collect::<Vec<_>>()
        .join("; ");
    if !cookies.is_empty()
        && let Ok(v) = HeaderValue::from_str(&cookies)
    {
        headers.insert(header::COOKIE, v);
    }
    headers
}

/// Streams the panel request body to reqwest. The pump task ends when the
/// body ends or the upstream request is dropped.
fn stream_body(body: Body) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, axum::Error>>(8);
    tokio::spawn(async move {
        let mut data = body.into_data_stream();
        while let Some(chunk) = data.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

fn proxy_error(status: &VmStatus) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ProxyErrorBody {
            error: "agent_unreachable".to_string(),
            vm_status: status.state,
            agent_ready: status.agent_ready,
        }),
    )
        .into_response()
}

fn agent_unreachable(state: &AppState) -> Response {
    // Re-check readiness right away instead of waiting for the next poll.
    let vm = state.vm.clone();
    tokio::spawn(async move {
        vm.probe_agent().await;
    });
    proxy_error(&state.vm.status())
}

async fn forward(state: &AppState, base_url: &str, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}{path}", base_url.trim_end_matches('/'));

    let mut headers = request_headers(&parts.headers);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    // The agent sees requests as coming from its own origin.
    if headers.contains_key(header::ORIGIN)
        && let Ok(origin) = HeaderValue::from_str(base_url.trim_end_matches('/'))
    {
        headers.insert(header::ORIGIN, origin);
    }

    let mut upstream = state
        .proxy
        .request(parts.method.clone(), &url)
        .headers(headers);
    if !body.is_end_stream() {
        upstream = upstream.body(stream_body(body));
    }

    // Bounds the wait for response headers; the body itself may stream on.
    let deadline = state.vm.timings().proxy_response_timeout;
    let upstream = match tokio::time::timeout(deadline, upstream.send()).await {
        Ok(Ok(v)) => v,
        Ok(Err(err)) => {
            tracing::warn!(%err, method = %parts.method, %path, "proxy to agent failed");
            return agent_unreachable(state);
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = deadline.as_millis() as u64,
                method = %parts.method,
                %path,
                "agent did not answer in time"
            );
            return agent_unreachable(state);
        }
    };

    let mut resp = Response::builder().status(upstream.status());
    if let Some(h) = resp.headers_mut() {
        copy_headers(upstream.headers(), h);
        h.insert(PROXIED_HEADER, HeaderValue::from_static("1"));
    }
    let body = Body::from_stream(upstream.bytes_stream().map_err(axum::Error::new));
    resp.body(body)
        .unwrap_or_else(|_| proxy_error(&state.vm.status()))
}

/// Middleware in front of every route. Proxied paths never reach the local
/// router: they are either forwarded to the agent or answered here.
pub async fn gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match classify(req.uri().path()) {
        RouteClass::Passthrough | RouteClass::Local => return next.run(req).await,
        RouteClass::Proxied => {}
    }

    let status = state.vm.status();
    if let Some((body, want_start)) = not_ready(&status) {
        if want_start && state.starter.fire(state.vm.clone()) {
            tracing::info!(path = %req.uri().path(), "request for stopped vm; starting it");
        }
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    let Some(base_url) = status.game_agent_url.clone() else {
        return proxy_error(&status);
    };

    if let Some(m) = &state.monitor {
        m.record_web_activity();
    }
    forward(&state, &base_url, req).await
}
