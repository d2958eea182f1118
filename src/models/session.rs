use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// How strongly a session was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            other => Err(AppError::MissingData(format!("unknown security_level '{}'", other))),
        }
    }
}

/// Represents a user session.
///
/// ⚠️ `session_token` and `refresh_token` are bearer secrets. They are never
/// serialized into API responses or audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub session_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    /// The refresh token replaced by the most recent rotation.
    #[serde(skip_serializing)]
    pub previous_refresh_token: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub remembered: bool,
    pub security_level: SecurityLevel,
    pub mfa_verified: bool,
    /// Active sessions the user held when this one was created, itself included.
    pub concurrent_count: i32,
    pub max_concurrent: i32,
}

impl Session {
    /// Absolute expiry: `now > expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Idle expiry: `now > last_activity + idle_timeout`.
    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        now > self.last_activity + idle_timeout
    }
}

/// The input to session creation, supplied once authentication has succeeded.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub ip: String,
    pub user_agent: String,
    pub remember_me: bool,
    /// Set by the MFA collaborator.
    pub mfa_verified: bool,
}

/// Why a session stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    Logout,
    IdleTimeout,
    AbsoluteExpiry,
    ConcurrencyEviction,
    Revoked,
    RefreshTokenReuse,
    Sweep,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InvalidationReason::Logout => "logout",
            InvalidationReason::IdleTimeout => "idle_timeout",
            InvalidationReason::AbsoluteExpiry => "absolute_expiry",
            InvalidationReason::ConcurrencyEviction => "concurrency_eviction",
            InvalidationReason::Revoked => "revoked",
            InvalidationReason::RefreshTokenReuse => "refresh_token_reuse",
            InvalidationReason::Sweep => "sweep",
        };
        f.write_str(label)
    }
}
