use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use tower_cookies::CookieManagerLayer;

use crate::{handlers, middleware_layer, state::AppState};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the HTTP router.
///
/// Admission control wraps every route, including unknown ones, so a
/// rejected method or path never reaches routing or session lookup.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/session/refresh", post(handlers::session::refresh))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/session", get(handlers::session::current_session))
        .route("/api/session/logout", post(handlers::session::logout))
        .route("/api/sessions", get(handlers::session::list_sessions))
        .route(
            "/api/sessions/revoke-others",
            post(handlers::session::revoke_others),
        )
        .route("/api/keys", get(handlers::keys::list_keys))
        .route("/api/keys/master", post(handlers::keys::create_master_key))
        .route(
            "/api/keys/master/{key_id}/unlock",
            post(handlers::keys::unlock_master_key),
        )
        .route("/api/keys/session", post(handlers::keys::create_session_key))
        .route("/api/keys/data", post(handlers::keys::create_data_key))
        .route("/api/keys/{key_id}", delete(handlers::keys::deactivate_key))
        .route("/api/vault/encrypt", post(handlers::keys::encrypt))
        .route("/api/vault/decrypt", post(handlers::keys::decrypt))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_session,
        ))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CookieManagerLayer::new())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(from_fn_with_state(
            state,
            middleware_layer::admission::admit_request,
        ))
}
