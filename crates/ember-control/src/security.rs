use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::Instrument;

use crate::auth::{ACCESS_COOKIE_NAME, CSRF_COOKIE_NAME};
use crate::gate::API_PREFIX;
use crate::state::AppState;

pub const CSRF_HEADER_NAME: &str = "x-csrf-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// API paths reachable without a session.
const PUBLIC_API_PATHS: &[&str] = &["/api/auth/csrf", "/api/auth/login"];

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        axum::Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Treat missing Origin as a non-browser client (curl, service-to-service).
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

fn request_has_cookie_header(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn csrf_is_valid(headers: &HeaderMap) -> bool {
    let jar = CookieJar::from_headers(headers);
    let Some(cookie) = jar.get(CSRF_COOKIE_NAME) else {
        return false;
    };
    let Some(header) = headers.get(CSRF_HEADER_NAME).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    cookie.value() == header
}

// Double-submit CSRF + Origin allowlist on state-changing requests, including
// the ones that end up proxied to the agent.
pub async fn csrf_and_origin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !is_unsafe_method(req.method()) {
        return next.run(req).await;
    }

    let headers = req.headers();
    if !origin_is_allowed(headers, &state.auth.allowed_origins) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }

    // Only enforce CSRF when cookies are present; non-browser clients stay usable.
    if request_has_cookie_header(headers) && !csrf_is_valid(headers) {
        return json_error(StatusCode::FORBIDDEN, "csrf invalid");
    }

    next.run(req).await
}

/// Requires a valid session cookie on every API path except login/csrf.
pub async fn api_auth_guard(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let under_api = path == API_PREFIX || path.starts_with("/api/");
    if !under_api || PUBLIC_API_PATHS.contains(&path) {
        return next.run(req).await;
    }

    let jar = CookieJar::from_headers(req.headers());
    let authed = jar
        .get(ACCESS_COOKIE_NAME)
        .is_some_and(|c| crate::auth::validate_access_jwt(&state.auth, c.value()).is_ok());
    if !authed {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    next.run(req).await
}

/// Tags every request with an id (client-supplied or fresh) and runs it in a
/// span carrying that id.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Ok(v) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, v);
    }

    let span = tracing::info_span!(
        "http",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}
