use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_cookies::cookie::time::Duration;
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    middleware_layer::auth::{extract_session_id, SESSION_ID_COOKIE, SESSION_TOKEN_COOKIE},
    models::session::Session,
    state::AppState,
};

/// The request payload for rotating a session's tokens.
#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// The response payload after a successful rotation. The new session token
/// travels in the `session_token` cookie.
#[derive(Serialize)]
pub struct RefreshResponse {
    pub session_id: Uuid,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// The response payload for session-ending requests.
#[derive(Serialize)]
pub struct RevokeResponse {
    pub success: bool,
    pub revoked: usize,
}

/// Creates a secure cookie with the given name and value that lives until
/// `expires_at`.
pub fn create_secure_cookie(name: &'static str, value: String, expires_at: DateTime<Utc>) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);

    let is_production = std::env::var("APP_ENV")
        .unwrap_or_else(|_| "development".to_string()) == "production";

    cookie.set_http_only(true);
    if is_production {
        cookie.set_secure(true);
    }

    cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
    let max_age = (expires_at - Utc::now()).num_seconds().max(0);
    cookie.set_max_age(Duration::seconds(max_age));
    cookie.set_path("/");

    cookie
}

/// Adds the `session_id` and `session_token` cookies for `session`.
pub fn set_session_cookies(cookies: &Cookies, session: &Session) {
    cookies.add(create_secure_cookie(
        SESSION_ID_COOKIE,
        session.id.to_string(),
        session.expires_at,
    ));
    cookies.add(create_secure_cookie(
        SESSION_TOKEN_COOKIE,
        session.session_token.clone(),
        session.expires_at,
    ));
}

fn clear_session_cookies(cookies: &Cookies) {
    for name in [SESSION_ID_COOKIE, SESSION_TOKEN_COOKIE] {
        let mut cookie = Cookie::new(name, "");
        cookie.set_max_age(Duration::seconds(0));
        cookie.set_path("/");
        cookies.remove(cookie);
    }
}

/// Returns the caller's session.
pub async fn current_session(Extension(session): Extension<Session>) -> Json<Session> {
    Json(session)
}

/// Lists the caller's active sessions, oldest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<Session>>> {
    let sessions = state.sessions.list_user_sessions(session.user_id).await?;
    Ok(Json(sessions))
}

/// Rotates the session and refresh tokens.
///
/// Only the `session_id` cookie and the refresh token are needed, so a
/// client whose session token was lost can still rotate.
pub async fn refresh(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<RefreshRequest>,
) -> Result<Response> {
    let session_id = extract_session_id(&cookies)
        .ok_or_else(|| AppError::Authentication("Missing session".to_string()))?;

    let session = state
        .sessions
        .refresh_session(session_id, &payload.refresh_token)
        .await
        .ok_or_else(|| AppError::Authentication("Invalid refresh token".to_string()))?;

    set_session_cookies(&cookies, &session);
    tracing::info!(%session_id, "🔄 Session tokens rotated");

    let response = RefreshResponse {
        session_id: session.id,
        refresh_token: session.refresh_token,
        expires_at: session.expires_at,
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Ends the caller's session.
pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    cookies: Cookies,
) -> Result<Response> {
    tracing::info!("👋 Logout for user: {}", session.user_id);

    let revoked = state.sessions.invalidate_session(session.id).await?;
    clear_session_cookies(&cookies);

    let response = RevokeResponse {
        success: true,
        revoked: usize::from(revoked),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Ends every other session of the caller.
pub async fn revoke_others(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let revoked = state
        .sessions
        .invalidate_all_user_sessions(session.user_id, Some(session.id))
        .await?;

    let response = RevokeResponse { success: true, revoked };
    Ok((StatusCode::OK, Json(response)).into_response())
}
