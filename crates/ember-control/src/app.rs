use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use ember_vm::VmState;
use serde::Serialize;

use crate::security::ErrorBody;
use crate::state::AppState;
use crate::{auth, gate, security, vm_routes};

// Public: no addresses or instance identifiers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthzVm {
    state: VmState,
    agent_ready: bool,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    auto_shutdown: bool,
    vm: HealthzVm,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let st = state.vm.status();
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        auto_shutdown: state.monitor.is_some(),
        vm: HealthzVm {
            state: st.state,
            agent_ready: st.agent_ready,
        },
    })
}

async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            message: "not found".to_string(),
        }),
    )
}

/// Full panel router. Layer order, outermost first: request id, origin/CSRF,
/// session guard, then the gate (which forwards agent paths and never lets
/// them reach the local routes).
pub fn router(state: AppState) -> Router {
    let auth_router = Router::new()
        .route("/csrf", get(auth::csrf))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/whoami", get(auth::whoami));

    let vm_router = Router::new()
        .route("/status", get(vm_routes::status))
        .route("/start", post(vm_routes::start))
        .route("/stop", post(vm_routes::stop))
        .route("/inactivity", get(vm_routes::inactivity))
        .route("/events", get(vm_routes::events));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/auth", auth_router)
        .nest("/api/vm", vm_router)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), gate::gate))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::api_auth_guard,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::csrf_and_origin,
        ))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use axum::{body::Body, http::Request, response::Response};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::make_access_jwt;
    use crate::testing::{FakeVm, auth_config};

    fn session_cookie() -> String {
        let tok = make_access_jwt(&auth_config(), "admin").unwrap();
        format!("access={tok}; csrf=abc")
    }

    async fn json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_public_and_tagged() {
        let vm = FakeVm::new(VmState::Running, true, "http://10.0.0.5:8081");
        let app = router(AppState::for_tests(vm, None));
        let resp = app
            .oneshot(
                Request::get("/healthz")
                    .header("x-request-id", "req-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-request-id"], "req-1");
        let v = json(resp).await;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["vm"]["state"], "running");
        assert_eq!(v["vm"]["agentReady"], true);
        let vm = v["vm"].as_object().unwrap();
        assert_eq!(vm.len(), 2);
        assert!(!v.to_string().contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn anonymous_api_calls_are_rejected_before_the_gate() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm.clone(), None));
        for path in ["/api/servers", "/api/vm/status"] {
            let resp = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{path}");
            assert!(resp.headers().contains_key("x-request-id"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vm.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn login_sets_session_cookie() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm, None));
        let resp = app
            .oneshot(
                Request::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .header("origin", "http://localhost:5173")
                    .body(Body::from(r#"{"username":"admin","password":"hunter2"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let cookies: Vec<_> = resp
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("access=")), "{cookies:?}");
        assert_eq!(json(resp).await["username"], "admin");
    }

    #[tokio::test]
    async fn foreign_origin_cannot_start_the_vm() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm.clone(), None));
        let resp = app
            .oneshot(
                Request::post("/api/vm/start")
                    .header("origin", "https://evil.example")
                    .header("cookie", session_cookie())
                    .header("x-csrf-token", "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vm.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn authenticated_proxied_request_reaches_the_gate() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm.clone(), None));
        let resp = app
            .oneshot(
                Request::get("/api/servers")
                    .header("cookie", session_cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let v = json(resp).await;
        assert_eq!(v["error"], "vm_not_ready");
        assert_eq!(v["retryAfterMs"], 10_000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vm.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authenticated_start_returns_accepted() {
        let vm = FakeVm::new(VmState::Stopped, false, "http://127.0.0.1:1");
        let app = router(AppState::for_tests(vm.clone(), None));
        let resp = app
            .oneshot(
                Request::post("/api/vm/start")
                    .header("origin", "http://localhost:5173")
                    .header("cookie", session_cookie())
                    .header("x-csrf-token", "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vm.starts.load(Ordering::SeqCst), 1);
    }
}
