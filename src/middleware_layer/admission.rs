use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::{
    admission::{RateLimitStatus, Rejection},
    clock::Clock,
    error::AppError,
    state::AppState,
    validation::request::AdmissionRequest,
};

/// Extracts the real IP address from the request extensions.
///
/// # Arguments
///
/// * `req` - The incoming request.
///
/// # Returns
///
/// The IP address as a string, or "unknown" if not found.
fn extract_real_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_rate_limit_headers(response: &mut Response, status: &RateLimitStatus) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(status.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(status.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(status.reset_time.timestamp().max(0) as u64),
    );
}

/// A middleware that runs every request through admission control before
/// any routing, session lookup or body parsing happens.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `req` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// The downstream `Response`, or the rejection rendered as an `AppError`.
pub async fn admit_request(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let candidate = AdmissionRequest {
        method: req.method().as_str().to_string(),
        path: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default(),
        ip: extract_real_ip(&req),
    };

    match state.admission.admit(&candidate).await {
        Ok(status) => {
            let mut response = next.run(req).await;
            set_rate_limit_headers(&mut response, &status);
            response
        }
        Err(Rejection::RateLimited(status)) => {
            let retry_after = (status.reset_time - state.clock.now()).num_seconds().max(1) as u64;
            let mut response = AppError::from(Rejection::RateLimited(status.clone())).into_response();
            set_rate_limit_headers(&mut response, &status);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
        Err(rejection) => AppError::from(rejection).into_response(),
    }
}
