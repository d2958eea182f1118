use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    error::AppError,
    state::AppState,
};

/// The cookie carrying the session id.
pub const SESSION_ID_COOKIE: &str = "session_id";
/// The cookie carrying the session token.
pub const SESSION_TOKEN_COOKIE: &str = "session_token";

/// Extracts the session id from the request cookies.
pub fn extract_session_id(cookies: &Cookies) -> Option<Uuid> {
    cookies
        .get(SESSION_ID_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

/// A middleware that requires a valid session to be present.
///
/// On success the validated `Session` is inserted into the request
/// extensions for handlers to pick up with `Extension<Session>`.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `cookies` - The request cookies.
/// * `request` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// A `Response` or an `AppError::Authentication`.
pub async fn require_session(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    tracing::debug!("🔐 Checking session...");

    let session_id = extract_session_id(&cookies).ok_or_else(|| {
        tracing::debug!("❌ No session_id cookie found");
        AppError::Authentication("Missing session".to_string())
    })?;

    let token = cookies
        .get(SESSION_TOKEN_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .ok_or_else(|| AppError::Authentication("Missing session token".to_string()))?;

    let session = state
        .sessions
        .validate_session(session_id, &token)
        .await
        .ok_or_else(|| AppError::Authentication("Invalid or expired session".to_string()))?;

    tracing::debug!(user_id = %session.user_id, "✅ Session validated");

    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}
