use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use garde::Validate;
use tokio::sync::watch;

use crate::error::AppError;

/// Minimum PBKDF2 iteration count accepted for master key derivation.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// The process configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server. When set, rate-limit windows live in Redis.
    pub redis_url: Option<String>,
    /// The address the HTTP adapter binds to.
    pub bind_addr: SocketAddr,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// The initial security policy.
    pub policy: SecurityPolicy,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .context("Invalid BIND_ADDR")?;

        let sweep_secs: u64 = env_or("SWEEP_INTERVAL_SECS", 300)?;
        if sweep_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than zero");
        }

        let policy = SecurityPolicy::from_env()?;
        policy
            .check()
            .map_err(|e| anyhow::anyhow!("Invalid security policy: {}", e))?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            bind_addr,
            sweep_interval: Duration::from_secs(sweep_secs),
            policy,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str, default: Vec<String>) -> Vec<String> {
    match env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Err(_) => default,
    }
}

/// Session lifetime and concurrency limits.
#[derive(Debug, Clone, Validate)]
pub struct SessionPolicy {
    /// Absolute lifetime of a normal session, in minutes.
    #[garde(range(min = 1, max = 43_200))]
    pub session_timeout_min: i64,
    /// Inactivity window, in minutes.
    #[garde(range(min = 1, max = 43_200))]
    pub idle_timeout_min: i64,
    /// Absolute lifetime of a "remember me" session, in days.
    #[garde(range(min = 1, max = 365))]
    pub remember_duration_days: i64,
    /// Maximum simultaneously active sessions per user.
    #[garde(range(min = 1, max = 1_000))]
    pub max_concurrent: u32,
    /// Revoke a session when an already-rotated refresh token is replayed.
    #[garde(skip)]
    pub detect_refresh_reuse: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_timeout_min: 60,
            idle_timeout_min: 30,
            remember_duration_days: 30,
            max_concurrent: 5,
            detect_refresh_reuse: false,
        }
    }
}

/// Key derivation and quota settings.
#[derive(Debug, Clone, Validate)]
pub struct KeyPolicy {
    #[garde(range(min = MIN_PBKDF2_ITERATIONS))]
    pub pbkdf2_iterations: u32,
    #[garde(range(min = 1, max = 100_000))]
    pub max_keys_per_owner: usize,
    #[garde(range(min = 1, max = 8_760))]
    pub session_key_ttl_hours: i64,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            max_keys_per_owner: 100,
            session_key_ttl_hours: 24,
        }
    }
}

/// Rate limiting and request-shape rules.
#[derive(Debug, Clone, Validate)]
pub struct AdmissionPolicy {
    #[garde(range(min = 1))]
    pub default_rate_limit: u32,
    #[garde(range(min = 1, max = 86_400))]
    pub window_seconds: u64,
    /// Deny requests once a window's count passes its limit.
    #[garde(skip)]
    pub enforce_rate_limit: bool,
    /// Upper-case HTTP method names.
    #[garde(length(min = 1))]
    pub allowed_methods: Vec<String>,
    #[garde(range(min = 1, max = 65_536))]
    pub max_path_length: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            default_rate_limit: 100,
            window_seconds: 60,
            enforce_rate_limit: true,
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_path_length: 2048,
        }
    }
}

/// IP block and allow lists shared by session creation and request validation.
#[derive(Debug, Clone, Default, Validate)]
pub struct IpAccessPolicy {
    #[garde(skip)]
    pub blocked_ips: Vec<String>,
    /// When non-empty, only these addresses are admitted.
    #[garde(skip)]
    pub allowed_ips: Vec<String>,
}

impl IpAccessPolicy {
    /// Returns `true` if `ip` is on the block list.
    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_ips.iter().any(|entry| same_ip(entry, ip))
    }

    /// Returns `true` if `ip` is neither blocked nor excluded by a non-empty allow list.
    pub fn permits(&self, ip: &str) -> bool {
        if self.is_blocked(ip) {
            return false;
        }
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|entry| same_ip(entry, ip))
    }
}

fn same_ip(entry: &str, ip: &str) -> bool {
    match (IpAddr::from_str(entry.trim()), IpAddr::from_str(ip.trim())) {
        (Ok(a), Ok(b)) => a == b,
        _ => entry.trim() == ip.trim(),
    }
}

/// An immutable snapshot of every runtime-tunable rule.
#[derive(Debug, Clone, Default, Validate)]
pub struct SecurityPolicy {
    #[garde(dive)]
    pub session: SessionPolicy,
    #[garde(dive)]
    pub keys: KeyPolicy,
    #[garde(dive)]
    pub admission: AdmissionPolicy,
    #[garde(dive)]
    pub ip_access: IpAccessPolicy,
}

impl SecurityPolicy {
    /// Builds a policy from environment overrides on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            session: SessionPolicy {
                session_timeout_min: env_or("SESSION_TIMEOUT_MIN", defaults.session.session_timeout_min)?,
                idle_timeout_min: env_or("IDLE_TIMEOUT_MIN", defaults.session.idle_timeout_min)?,
                remember_duration_days: env_or(
                    "REMEMBER_DURATION_DAYS",
                    defaults.session.remember_duration_days,
                )?,
                max_concurrent: env_or("MAX_CONCURRENT_SESSIONS", defaults.session.max_concurrent)?,
                detect_refresh_reuse: env_or(
                    "DETECT_REFRESH_REUSE",
                    defaults.session.detect_refresh_reuse,
                )?,
            },
            keys: KeyPolicy {
                pbkdf2_iterations: env_or("PBKDF2_ITERATIONS", defaults.keys.pbkdf2_iterations)?,
                max_keys_per_owner: env_or("MAX_KEYS_PER_OWNER", defaults.keys.max_keys_per_owner)?,
                session_key_ttl_hours: env_or(
                    "SESSION_KEY_TTL_HOURS",
                    defaults.keys.session_key_ttl_hours,
                )?,
            },
            admission: AdmissionPolicy {
                default_rate_limit: env_or("DEFAULT_RATE_LIMIT", defaults.admission.default_rate_limit)?,
                window_seconds: env_or("RATE_LIMIT_WINDOW_SECS", defaults.admission.window_seconds)?,
                enforce_rate_limit: env_or(
                    "ENFORCE_RATE_LIMIT",
                    defaults.admission.enforce_rate_limit,
                )?,
                allowed_methods: env_list("ALLOWED_METHODS", defaults.admission.allowed_methods)
                    .into_iter()
                    .map(|m| m.to_ascii_uppercase())
                    .collect(),
                max_path_length: env_or("MAX_PATH_LENGTH", defaults.admission.max_path_length)?,
            },
            ip_access: IpAccessPolicy {
                blocked_ips: env_list("BLOCKED_IPS", Vec::new()),
                allowed_ips: env_list("ALLOWED_IPS", Vec::new()),
            },
        })
    }

    /// Validates every field, returning a `Configuration` error on the first bad value.
    pub fn check(&self) -> crate::error::Result<()> {
        self.validate()
            .map_err(|report| AppError::Configuration(report.to_string()))?;

        for entry in self
            .ip_access
            .blocked_ips
            .iter()
            .chain(self.ip_access.allowed_ips.iter())
        {
            if IpAddr::from_str(entry.trim()).is_err() {
                return Err(AppError::Configuration(format!(
                    "'{}' is not a valid IP address",
                    entry
                )));
            }
        }

        if self
            .admission
            .allowed_methods
            .iter()
            .any(|m| m.is_empty() || !m.bytes().all(|b| b.is_ascii_uppercase()))
        {
            return Err(AppError::Configuration(
                "allowed_methods must be upper-case method names".to_string(),
            ));
        }

        Ok(())
    }
}

/// Process-wide handle to the current [`SecurityPolicy`].
///
/// Readers take a cheap `Arc` snapshot; writers validate a complete new
/// policy and swap it in, so no reader ever sees a half-applied update.
#[derive(Clone)]
pub struct PolicyHandle {
    tx: Arc<watch::Sender<Arc<SecurityPolicy>>>,
}

impl PolicyHandle {
    /// Creates a handle after validating `policy`.
    pub fn new(policy: SecurityPolicy) -> crate::error::Result<Self> {
        policy.check()?;
        let (tx, _rx) = watch::channel(Arc::new(policy));
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Returns the current policy snapshot.
    pub fn snapshot(&self) -> Arc<SecurityPolicy> {
        self.tx.borrow().clone()
    }

    /// Replaces the whole policy.
    pub fn update(&self, policy: SecurityPolicy) -> crate::error::Result<()> {
        policy.check()?;
        self.tx.send_replace(Arc::new(policy));
        tracing::info!("Security policy replaced");
        Ok(())
    }

    /// Applies `edit` to a copy of the current policy and swaps it in if it validates.
    pub fn modify<F>(&self, edit: F) -> crate::error::Result<()>
    where
        F: FnOnce(&mut SecurityPolicy),
    {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            let mut next = SecurityPolicy::clone(current);
            edit(&mut next);
            match next.check() {
                Ok(()) => {
                    *current = Arc::new(next);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if outcome.is_ok() {
            tracing::info!("Security policy updated");
        }
        outcome
    }

    /// Subscribes to policy changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SecurityPolicy>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(SecurityPolicy::default().check().is_ok());
    }

    #[test]
    fn rejects_weak_kdf_iterations() {
        let mut policy = SecurityPolicy::default();
        policy.keys.pbkdf2_iterations = 10_000;
        assert!(matches!(policy.check(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn rejects_unparsable_blocked_ip() {
        let mut policy = SecurityPolicy::default();
        policy.ip_access.blocked_ips.push("not-an-ip".to_string());
        assert!(matches!(policy.check(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn ip_access_honours_block_and_allow_lists() {
        let mut access = IpAccessPolicy::default();
        assert!(access.permits("198.51.100.7"));

        access.blocked_ips.push("198.51.100.7".to_string());
        assert!(!access.permits("198.51.100.7"));
        assert!(access.permits("198.51.100.8"));

        access.allowed_ips.push("203.0.113.5".to_string());
        assert!(access.permits("203.0.113.5"));
        assert!(!access.permits("198.51.100.8"));
        assert!(!access.permits("unknown"));
    }

    #[test]
    fn ipv6_entries_compare_by_address() {
        let access = IpAccessPolicy {
            blocked_ips: vec!["2001:db8::1".to_string()],
            allowed_ips: Vec::new(),
        };
        assert!(access.is_blocked("2001:0db8:0000:0000:0000:0000:0000:0001"));
    }

    #[test]
    fn modify_swaps_valid_policy_and_keeps_old_on_error() {
        let handle = PolicyHandle::new(SecurityPolicy::default()).unwrap();
        let before = handle.snapshot();

        handle
            .modify(|p| p.admission.default_rate_limit = 7)
            .unwrap();
        assert_eq!(handle.snapshot().admission.default_rate_limit, 7);
        assert_eq!(before.admission.default_rate_limit, 100);

        let err = handle.modify(|p| p.session.max_concurrent = 0);
        assert!(matches!(err, Err(AppError::Configuration(_))));
        assert_eq!(handle.snapshot().session.max_concurrent, 5);
    }
}
