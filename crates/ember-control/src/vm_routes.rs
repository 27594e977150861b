use std::convert::Infallible;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use ember_vm::{InactivityStatus, VmState, VmStatus};
use futures_util::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::security::ErrorBody;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatusResponse {
    #[serde(flatten)]
    pub vm: VmStatus,
    pub inactivity: Option<InactivityStatus>,
}

fn snapshot(state: &AppState) -> VmStatusResponse {
    VmStatusResponse {
        vm: state.vm.status(),
        inactivity: state.monitor.as_ref().map(|m| m.status()),
    }
}

pub async fn status(State(state): State<AppState>) -> Json<VmStatusResponse> {
    Json(snapshot(&state))
}

pub async fn start(State(state): State<AppState>) -> Response {
    if state.starter.fire(state.vm.clone()) {
        tracing::info!("vm start requested");
    }
    (StatusCode::ACCEPTED, Json(snapshot(&state))).into_response()
}

pub async fn stop(State(state): State<AppState>) -> Response {
    // A manual stop must not race an idle shutdown.
    if let Some(m) = &state.monitor {
        m.stop();
    }
    tracing::info!("vm stop requested");
    let out = state.vm.stop().await;
    if out.success {
        return Json(out).into_response();
    }

    tracing::warn!(error = ?out.error, "vm stop failed");
    if let Some(m) = &state.monitor
        && state.vm.status().state == VmState::Running
    {
        m.start();
    }
    (StatusCode::BAD_GATEWAY, Json(out)).into_response()
}

pub async fn inactivity(State(state): State<AppState>) -> Response {
    match &state.monitor {
        Some(m) => Json(m.status()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                message: "auto-shutdown is disabled".to_string(),
            }),
        )
            .into_response(),
    }
}

fn broadcast_events<T>(
    rx: broadcast::Receiver<T>,
    name: &'static str,
) -> BoxStream<'static, Result<Event, Infallible>>
where
    T: Clone + Serialize + Send + 'static,
{
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => match Event::default().event(name).json_data(&ev) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(err) => tracing::warn!(%err, event = name, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, event = name, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Server-sent events: one `status` snapshot, then `vm` and `inactivity`
/// notifications as they happen.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let vm_events = broadcast_events(state.vm.subscribe(), "vm");
    let idle_events = match &state.monitor {
        Some(m) => broadcast_events(m.subscribe(), "inactivity"),
        None => stream::pending().boxed(),
    };

    let first = match Event::default().event("status").json_data(snapshot(&state)) {
        Ok(event) => stream::once(async move { Ok(event) }).boxed(),
        Err(err) => {
            tracing::warn!(%err, "failed to encode status snapshot");
            stream::empty().boxed()
        }
    };

    let stream = first
        .chain(stream::select(vm_events, idle_events))
        .boxed();
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use axum::{
        Router,
        body::Body,
        http::Request,
        routing::{get, post},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::InactivityConfig;
    use crate::inactivity::InactivityMonitor;
    use crate::testing::{FakeAgent, FakeVm};
    use crate::vm::VmController;

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/vm/status", get(status))
            .route("/api/vm/start", post(start))
            .route("/api/vm/stop", post(stop))
            .route("/api/vm/inactivity", get(inactivity))
            .with_state(state)
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let code = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    async fn next_chunk(body: &mut Body) -> String {
        loop {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                return String::from_utf8(data.to_vec()).unwrap();
            }
        }
    }

    fn monitor_for(vm: std::sync::Arc<FakeVm>) -> InactivityMonitor {
        InactivityMonitor::new(vm, FakeAgent::healthy(), InactivityConfig::default())
    }

    #[tokio::test]
    async fn status_includes_vm_and_inactivity() {
        let vm = FakeVm::new(VmState::Running, true, "http://10.0.0.5:8081");
        let monitor = monitor_for(vm.clone());
        monitor.start();
        let app = router(AppState::for_tests(vm, Some(monitor.clone())));

        let (code, v) = call(&app, Request::get("/api/vm/status").body(Body::empty()).unwrap()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["state"], "running");
        assert_eq!(v["agentReady"], true);
        assert_eq!(v["gameAgentUrl"], "http://10.0.0.5:8081");
        assert_eq!(v["inactivity"]["running"], true);
        assert_eq!(v["inactivity"]["timeoutMinutes"], 30);
        monitor.stop();
    }

    #[tokio::test]
    async fn inactivity_without_monitor_is_404() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm, None));
        let (code, v) = call(
            &app,
            Request::get("/api/vm/inactivity").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(v["message"], "auto-shutdown is disabled");
    }

    #[tokio::test]
    async fn start_is_accepted_and_single_flight() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        *vm.start_delay.lock().unwrap() = Duration::from_millis(200);
        let app = router(AppState::for_tests(vm.clone(), None));

        for _ in 0..3 {
            let (code, _) = call(
                &app,
                Request::post("/api/vm/start").body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(code, StatusCode::ACCEPTED);
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(vm.starts.load(Ordering::SeqCst), 1);
        assert!(vm.status().is_ready());
    }

    #[tokio::test]
    async fn stop_halts_monitor_then_stops_vm() {
        let vm = FakeVm::new(VmState::Running, true, "http://127.0.0.1:1");
        let monitor = monitor_for(vm.clone());
        monitor.start();
        let app = router(AppState::for_tests(vm.clone(), Some(monitor.clone())));

        let (code, v) = call(&app, Request::post("/api/vm/stop").body(Body::empty()).unwrap()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(v["success"], true);
        assert_eq!(v["state"], "stopped");
        assert!(!monitor.is_running());
        assert_eq!(vm.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_stop_resumes_monitor() {
        let vm = FakeVm::new(VmState::Running, true, "http://127.0.0.1:1");
        vm.fail_stops.store(1, Ordering::SeqCst);
        let monitor = monitor_for(vm.clone());
        monitor.start();
        let app = router(AppState::for_tests(vm.clone(), Some(monitor.clone())));

        let (code, v) = call(&app, Request::post("/api/vm/stop").body(Body::empty()).unwrap()).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "permission denied");
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[tokio::test]
    async fn event_stream_starts_with_snapshot_then_relays() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let monitor = monitor_for(vm.clone());
        let state = AppState::for_tests(vm.clone(), Some(monitor.clone()));
        let app = Router::new()
            .route("/api/vm/events", get(events))
            .with_state(state);

        let resp = app
            .oneshot(Request::get("/api/vm/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();

        let mut seen = next_chunk(&mut body).await;
        assert!(seen.contains("event: status"), "{seen}");
        assert!(seen.contains("\"state\":\"stopped\""), "{seen}");

        vm.set(VmState::Running, false);
        seen.push_str(&next_chunk(&mut body).await);
        assert!(seen.contains("event: vm"), "{seen}");
        assert!(seen.contains("state_changed"), "{seen}");

        monitor.start();
        let mut tail = String::new();
        while !tail.contains("event: inactivity") {
            tail.push_str(&next_chunk(&mut body).await);
        }
        assert!(tail.contains("started"), "{tail}");
        monitor.stop();
    }
}
