use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::admission::window_store::{MAX_WINDOW_SECONDS, WindowKey, WindowStore, window_length};
use crate::clock::Clock;
use crate::config::PolicyHandle;
use crate::error::Result;

/// The outcome of counting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub current: u64,
    pub limit: u32,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitStatus {
    /// `true` once the window's count has gone past its limit.
    pub fn is_exceeded(&self) -> bool {
        self.current > u64::from(self.limit)
    }

    fn permissive(limit: u32, window_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            current: 0,
            limit,
            remaining: u64::from(limit),
            reset_time: now + window_length(window_seconds),
        }
    }
}

/// Fixed-window request counter.
///
/// Only reports counts; whether to deny is the caller's decision (see
/// [`crate::admission::AdmissionControl::admit`]).
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    policy: PolicyHandle,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, policy: PolicyHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, policy, clock }
    }

    fn window_key(&self, identifier: &str, limit: Option<u32>, window_seconds: Option<u64>) -> WindowKey {
        let policy = self.policy.snapshot();
        WindowKey {
            identifier: identifier.to_string(),
            limit: limit
                .filter(|l| *l > 0)
                .unwrap_or(policy.admission.default_rate_limit),
            window_seconds: window_seconds
                .filter(|w| *w > 0)
                .unwrap_or(policy.admission.window_seconds)
                .min(MAX_WINDOW_SECONDS),
        }
    }

    /// Counts one request for `identifier`. Falls back to the policy's default
    /// limit and window when either is omitted; windows are capped at
    /// [`MAX_WINDOW_SECONDS`].
    ///
    /// Fails open: a store error yields a permissive status instead of an error.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        limit: Option<u32>,
        window_seconds: Option<u64>,
    ) -> RateLimitStatus {
        let key = self.window_key(identifier, limit, window_seconds);
        let now = self.clock.now();

        match self.store.hit(&key, now).await {
            Ok(window) => {
                let status = RateLimitStatus {
                    current: window.count,
                    limit: key.limit,
                    remaining: u64::from(key.limit).saturating_sub(window.count),
                    reset_time: window.reset_time(),
                };
                tracing::debug!(
                    identifier,
                    current = status.current,
                    remaining = status.remaining,
                    "Rate limit checked"
                );
                status
            }
            Err(e) => {
                tracing::warn!(identifier, error = %e, "⚠️ Rate limit store failed, allowing request");
                RateLimitStatus::permissive(key.limit, key.window_seconds, now)
            }
        }
    }

    /// Clears the window for `identifier`, e.g. after a successful login.
    pub async fn reset(&self, identifier: &str, limit: Option<u32>, window_seconds: Option<u64>) -> Result<()> {
        let key = self.window_key(identifier, limit, window_seconds);
        self.store.reset(&key).await
    }

    /// Drops closed windows so the table does not grow without bound.
    pub async fn purge_expired_windows(&self) -> Result<usize> {
        self.store.purge_expired(self.clock.now()).await
    }
}
