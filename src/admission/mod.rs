//! Admission control: the first gate a request passes.
//!
//! Request shape and origin are validated before the rate window is
//! touched, so a rejected request never consumes rate budget.

use thiserror::Error;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::PolicyHandle;
use crate::error::AppError;
use crate::validation::request::{AdmissionRequest, RequestRejection, RequestValidator};

pub mod rate_limit;
pub mod window_store;

pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use window_store::{MemoryWindowStore, RateLimitWindow, RedisWindowStore, WindowKey, WindowStore};

/// Why [`AdmissionControl::admit`] turned a request away.
#[derive(Debug, Clone, Error)]
pub enum Rejection {
    #[error(transparent)]
    Invalid(#[from] RequestRejection),

    #[error("Rate limit exceeded: {} of {} requests", .0.current, .0.limit)]
    RateLimited(RateLimitStatus),
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Invalid(RequestRejection::MethodNotAllowed(method)) => AppError::MethodNotAllowed(method),
            Rejection::Invalid(RequestRejection::IpNotAllowed(ip)) => AppError::IpNotAllowed(ip),
            Rejection::Invalid(other) => AppError::Validation(other.to_string()),
            Rejection::RateLimited(status) => AppError::LimitExceeded(format!(
                "Too many requests, retry after {}",
                status.reset_time.to_rfc3339()
            )),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionControl {
    validator: RequestValidator,
    limiter: RateLimiter,
    policy: PolicyHandle,
    audit: AuditLog,
}

impl AdmissionControl {
    pub fn new(validator: RequestValidator, limiter: RateLimiter, policy: PolicyHandle, audit: AuditLog) -> Self {
        Self {
            validator,
            limiter,
            policy,
            audit,
        }
    }

    pub fn validator(&self) -> &RequestValidator {
        &self.validator
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Validates `req`, then counts it against the client IP's window.
    ///
    /// A window past its limit denies the request only while the policy's
    /// `enforce_rate_limit` is on; otherwise the status is passed through.
    pub async fn admit(&self, req: &AdmissionRequest) -> Result<RateLimitStatus, Rejection> {
        let outcome = self.validator.validate_request(req);
        if let Some(error) = outcome.error {
            tracing::warn!(ip = %req.ip, method = %req.method, reason = %error, "❌ Request rejected");
            self.audit.record(AuditEvent::RequestRejected {
                ip: req.ip.clone(),
                reason: error.to_string(),
            });
            return Err(Rejection::Invalid(error));
        }

        let status = self.limiter.check_rate_limit(&req.ip, None, None).await;
        if status.is_exceeded() && self.policy.snapshot().admission.enforce_rate_limit {
            tracing::warn!(ip = %req.ip, current = status.current, limit = status.limit, "❌ Rate limit exceeded");
            self.audit.record(AuditEvent::RateLimitDenied {
                identifier: req.ip.clone(),
                limit: status.limit,
                current: status.current,
            });
            return Err(Rejection::RateLimited(status));
        }

        Ok(status)
    }
}
