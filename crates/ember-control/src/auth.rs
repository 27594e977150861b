use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::security::ErrorBody;
use crate::state::AppState;

pub const CSRF_COOKIE_NAME: &str = "csrf";
pub const ACCESS_COOKIE_NAME: &str = "access";

const ISSUER: &str = "ember";
const AUDIENCE: &str = "ember-web";
const SESSION_HOURS: i64 = 12;

fn json_error(code: StatusCode, message: impl Into<String>) -> impl IntoResponse {
    (
        code,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn random_token(n: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    // URL-safe base64 without padding.
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn csrf_cookie(value: String) -> Cookie<'static> {
    // Non-HttpOnly so the browser app can read and send it as a header.
    let mut c = Cookie::new(CSRF_COOKIE_NAME, value);
    c.set_http_only(false);
    c.set_same_site(SameSite::Lax);
    c.set_path("/");
    c
}

fn access_cookie(jwt: String) -> Cookie<'static> {
    let mut c = Cookie::new(ACCESS_COOKIE_NAME, jwt);
    c.set_http_only(true);
    c.set_same_site(SameSite::Lax);
    c.set_path("/");
    c
}

fn clear_cookie(name: &'static str) -> Cookie<'static> {
    let mut c = Cookie::new(name, "");
    c.set_path("/");
    c.make_removal();
    c
}

#[derive(Debug, Serialize)]
pub struct CsrfResponse {
    pub token: String,
}

pub async fn csrf(jar: CookieJar) -> impl IntoResponse {
    let token = random_token(32);
    let jar = jar.add(csrf_cookie(token.clone()));
    (jar, Json(CsrfResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhoamiResponse {
    pub username: String,
}

fn verify_password(hash: &str, password: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn credentials_ok(cfg: &AuthConfig, username: &str, password: &str) -> bool {
    let user_ok = constant_time_eq(username.as_bytes(), cfg.admin_user.as_bytes());
    let pass_ok = match &cfg.admin_pass_hash {
        Some(hash) => verify_password(hash, password),
        None => constant_time_eq(password.as_bytes(), cfg.admin_pass.as_bytes()),
    };
    user_ok && pass_ok
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    iat: usize,
    iss: String,
    aud: String,
}

pub fn make_access_jwt(cfg: &AuthConfig, username: &str) -> anyhow::Result<String> {
    let now = time::OffsetDateTime::now_utc();
    let exp = (now + time::Duration::hours(SESSION_HOURS)).unix_timestamp() as usize;
    let iat = now.unix_timestamp() as usize;

    let claims = Claims {
        sub: username.to_string(),
        exp,
        iat,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };

    Ok(jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(&cfg.jwt_secret),
    )?)
}

pub fn validate_access_jwt(cfg: &AuthConfig, token: &str) -> anyhow::Result<WhoamiResponse> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&cfg.jwt_secret),
        &validation,
    )?;

    Ok(WhoamiResponse {
        username: data.claims.sub,
    })
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> axum::response::Response {
    if !credentials_ok(&state.auth, req.username.trim(), &req.password) {
        tracing::warn!(username = %req.username, "login rejected");
        return json_error(StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }

    let jwt = match make_access_jwt(&state.auth, &state.auth.admin_user) {
        Ok(v) => v,
        Err(err) => {
            tracing::error!(%err, "failed to sign session token");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create session")
                .into_response();
        }
    };

    tracing::info!(username = %state.auth.admin_user, "login ok");
    let jar = jar.add(access_cookie(jwt));
    (
        jar,
        Json(WhoamiResponse {
            username: state.auth.admin_user.clone(),
        }),
    )
        .into_response()
}

pub async fn logout(jar: CookieJar) -> impl IntoResponse {
    let jar = jar
        .add(clear_cookie(ACCESS_COOKIE_NAME))
        .add(clear_cookie(CSRF_COOKIE_NAME));
    (jar, StatusCode::NO_CONTENT)
}

pub async fn whoami(State(state): State<AppState>, jar: CookieJar) -> axum::response::Response {
    let Some(token) = jar.get(ACCESS_COOKIE_NAME).map(|c| c.value().to_string()) else {
        return json_error(StatusCode::UNAUTHORIZED, "not logged in").into_response();
    };
    match validate_access_jwt(&state.auth, &token) {
        Ok(who) => Json(who).into_response(),
        Err(_) => json_error(StatusCode::UNAUTHORIZED, "session expired").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AuthConfig {
        AuthConfig {
            admin_user: "admin".into(),
            admin_pass: "hunter2".into(),
            admin_pass_hash: None,
            jwt_secret: b"test-secret".to_vec(),
            allowed_origins: vec![],
        }
    }

    #[test]
    fn jwt_round_trips_and_rejects_other_secret() {
        let c = cfg();
        let tok = make_access_jwt(&c, "admin").unwrap();
        assert_eq!(validate_access_jwt(&c, &tok).unwrap().username, "admin");

        let other = AuthConfig {
            jwt_secret: b"other".to_vec(),
            ..cfg()
        };
        assert!(validate_access_jwt(&other, &tok).is_err());
    }

    #[test]
    fn plain_credentials_are_checked() {
        let c = cfg();
        assert!(credentials_ok(&c, "admin", "hunter2"));
        assert!(!credentials_ok(&c, "admin", "hunter3"));
        assert!(!credentials_ok(&c, "root", "hunter2"));
    }

    #[test]
    fn hashed_password_takes_precedence() {
        use argon2::password_hash::{PasswordHasher, SaltString};
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let hash = argon2::Argon2::default()
            .hash_password(b"s3cret", &salt)
            .unwrap()
            .to_string();
        let c = AuthConfig {
            admin_pass_hash: Some(hash),
            ..cfg()
        };
        assert!(credentials_ok(&c, "admin", "s3cret"));
        assert!(!credentials_ok(&c, "admin", "hunter2"));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("not-a-phc-string", "anything"));
    }
}
