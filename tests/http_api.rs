use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, StatusCode, header},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use trust_core::audit::AuditLog;
use trust_core::clock::ManualClock;
use trust_core::config::{PolicyHandle, SecurityPolicy};
use trust_core::models::session::{NewSession, Session};
use trust_core::{AppState, routes};

// Shared test context
struct TestContext {
    state: AppState,
    clock: ManualClock,
}

impl TestContext {
    fn new() -> Self {
        Self::with_policy(SecurityPolicy::default())
    }

    fn with_policy(policy: SecurityPolicy) -> Self {
        Self::starting_at(policy, Utc::now())
    }

    fn starting_at(policy: SecurityPolicy, start: DateTime<Utc>) -> Self {
        let clock = ManualClock::new(start);
        let state = AppState::in_memory(
            PolicyHandle::new(policy).unwrap(),
            Arc::new(clock.clone()),
            AuditLog::default(),
        );
        Self { state, clock }
    }

    async fn login(&self) -> Session {
        self.state
            .sessions
            .create_session(NewSession {
                user_id: Uuid::new_v4(),
                ip: "203.0.113.20".to_string(),
                user_agent: "http-test".to_string(),
                remember_me: false,
                mfa_verified: false,
            })
            .await
            .unwrap()
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        routes::router(self.state.clone()).oneshot(request).await.unwrap()
    }
}

fn cookie_header(session: &Session) -> String {
    format!("session_id={}; session_token={}", session.id, session.session_token)
}

fn from_ip(mut request: Request<Body>, ip: [u8; 4]) -> Request<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    request
}

fn json_request(method: &str, uri: &str, session: Option<&Session>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, cookie_header(session));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, session: Option<&Session>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(session) = session {
        builder = builder.header(header::COOKIE, cookie_header(session));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_is_rejected_with_405() {
        let context = TestContext::new();
        let request = Request::builder()
            .method("TRACE")
            .uri("/api/session")
            .body(Body::empty())
            .unwrap();

        let response = context.send(request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.headers().get("x-ratelimit-remaining").is_none());
    }

    #[tokio::test]
    async fn test_traversal_path_is_rejected() {
        let context = TestContext::new();
        let response = context.send(get("/api/../etc/passwd", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("traversal"));
    }

    #[tokio::test]
    async fn test_blocked_ip_is_forbidden() {
        let mut policy = SecurityPolicy::default();
        policy.ip_access.blocked_ips.push("198.51.100.7".to_string());
        let context = TestContext::with_policy(policy);

        let response = context.send(from_ip(get("/api/session", None), [198, 51, 100, 7])).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = context.send(from_ip(get("/api/session", None), [198, 51, 100, 8])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_routes_require_cookies() {
        let context = TestContext::new();
        let response = context.send(get("/api/session", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut session = context.login().await;
        session.session_token = "forged".to_string();
        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_current_session_hides_tokens() {
        let context = TestContext::new();
        let session = context.login().await;

        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");

        let body = body_json(response).await;
        assert_eq!(body["id"], json!(session.id));
        assert_eq!(body["user_id"], json!(session.user_id));
        assert!(body.get("session_token").is_none());
        assert!(body.get("refresh_token").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429() {
        let mut policy = SecurityPolicy::default();
        policy.admission.default_rate_limit = 2;
        let context = TestContext::with_policy(policy);
        let session = context.login().await;

        for _ in 0..2 {
            let response = context.send(get("/api/session", Some(&session))).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[tokio::test]
    async fn test_retry_after_follows_the_service_clock() {
        let mut policy = SecurityPolicy::default();
        policy.admission.default_rate_limit = 1;
        let start = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
        let context = TestContext::starting_at(policy, start);
        let session = context.login().await;

        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::OK);

        context.clock.advance(Duration::seconds(15));
        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "45");
    }

    #[tokio::test]
    async fn test_refresh_and_logout() {
        let context = TestContext::new();
        let session = context.login().await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/session/refresh")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, format!("session_id={}", session.id))
            .body(Body::from(json!({ "refresh_token": session.refresh_token }).to_string()))
            .unwrap();
        let response = context.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert!(set_cookies.iter().any(|c| c.starts_with("session_token=")));

        let body = body_json(response).await;
        let new_refresh = body["refresh_token"].as_str().unwrap();
        assert_ne!(new_refresh, session.refresh_token);

        // The old session token no longer works.
        let response = context.send(get("/api/session", Some(&session))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let rotated = context
            .state
            .sessions
            .list_user_sessions(session.user_id)
            .await
            .unwrap()
            .remove(0);
        let response = context
            .send(json_request("POST", "/api/session/logout", Some(&rotated), json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["revoked"], 1);

        let response = context.send(get("/api/session", Some(&rotated))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revoke_other_sessions() {
        let context = TestContext::new();
        let session = context.login().await;
        let user_id = session.user_id;
        for _ in 0..2 {
            context
                .state
                .sessions
                .create_session(NewSession {
                    user_id,
                    ip: "203.0.113.21".to_string(),
                    user_agent: "other-device".to_string(),
                    remember_me: false,
                    mfa_verified: false,
                })
                .await
                .unwrap();
        }

        let response = context
            .send(json_request("POST", "/api/sessions/revoke-others", Some(&session), json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["revoked"], 2);

        let response = context.send(get("/api/sessions", Some(&session))).await;
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vault_round_trip() {
        let context = TestContext::new();
        let session = context.login().await;

        let response = context
            .send(json_request(
                "POST",
                "/api/keys/master",
                Some(&session),
                json!({ "passphrase": "correct horse battery staple" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let master = body_json(response).await;
        assert_eq!(master["key_type"], "master");
        assert!(master.get("wrapped_key_bytes").is_none());

        let response = context
            .send(json_request(
                "POST",
                "/api/keys/session",
                Some(&session),
                json!({ "master_key_id": master["id"] }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let session_key = body_json(response).await;

        // "secret" in base64
        let response = context
            .send(json_request(
                "POST",
                "/api/vault/encrypt",
                Some(&session),
                json!({ "key_id": session_key["id"], "plaintext": "c2VjcmV0" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let envelope = body_json(response).await;
        assert_eq!(envelope["algorithm"], "AES-256-GCM");

        let response = context
            .send(json_request("POST", "/api/vault/decrypt", Some(&session), envelope.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["plaintext"], "c2VjcmV0");

        // Another user cannot open the envelope.
        let intruder = context.login().await;
        let response = context
            .send(json_request("POST", "/api/vault/decrypt", Some(&intruder), envelope))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = context.send(get("/api/keys", Some(&session))).await;
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_vault_rejects_unknown_key_and_bad_base64() {
        let context = TestContext::new();
        let session = context.login().await;

        let response = context
            .send(json_request(
                "POST",
                "/api/vault/encrypt",
                Some(&session),
                json!({ "key_id": Uuid::new_v4(), "plaintext": "c2VjcmV0" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = context
            .send(json_request(
                "POST",
                "/api/vault/decrypt",
                Some(&session),
                json!({
                    "ciphertext": "%%%",
                    "iv": "AAAAAAAAAAAAAAAA",
                    "key_id": Uuid::new_v4(),
                    "algorithm": "AES-256-GCM",
                    "created_at": Utc::now(),
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
