use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::admission::{AdmissionControl, MemoryWindowStore, RateLimiter, RedisWindowStore, WindowStore};
use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, PolicyHandle};
use crate::error::Result;
use crate::repositories::{
    KeyRepository, MemoryStore, PgKeyRepository, PgSessionRepository, SessionRepository,
};
use crate::services::keys::KeyHierarchyService;
use crate::services::sessions::SessionManager;
use crate::validation::request::RequestValidator;

/// The application's state. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// The envelope-encryption key hierarchy.
    pub keys: KeyHierarchyService,
    /// The session lifecycle manager.
    pub sessions: SessionManager,
    /// Request validation and rate limiting.
    pub admission: AdmissionControl,
    /// The live security policy.
    pub policy: PolicyHandle,
    /// The audit event sink.
    pub audit: AuditLog,
    /// The time source shared by every service.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates a new `AppState` backed by PostgreSQL, and by Redis for rate
    /// windows when a Redis URL is configured.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        crate::db::run_migrations(&db).await?;
        tracing::info!("✅ Schema migrations applied");

        let windows: Arc<dyn WindowStore> = match config.redis_url.as_deref() {
            Some(url) => {
                let redis_client = redis::Client::open(url)?;
                let redis = ConnectionManager::new(redis_client).await?;
                tracing::info!("✅ Redis Connection Manager initialized for rate-limit windows");
                Arc::new(RedisWindowStore::new(redis))
            }
            None => {
                tracing::info!("✅ In-memory rate-limit windows initialized");
                Arc::new(MemoryWindowStore::new())
            }
        };

        let policy = PolicyHandle::new(config.policy.clone())?;

        Ok(Self::from_parts(
            Arc::new(PgKeyRepository::new(db.clone())),
            Arc::new(PgSessionRepository::new(db)),
            windows,
            policy,
            Arc::new(SystemClock),
            AuditLog::default(),
        ))
    }

    /// Creates an `AppState` whose records and windows live in process memory.
    pub fn in_memory(policy: PolicyHandle, clock: Arc<dyn Clock>, audit: AuditLog) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::from_parts(
            store.clone(),
            store,
            Arc::new(MemoryWindowStore::new()),
            policy,
            clock,
            audit,
        )
    }

    /// Wires the services over the given collaborators.
    pub fn from_parts(
        key_repo: Arc<dyn KeyRepository>,
        session_repo: Arc<dyn SessionRepository>,
        windows: Arc<dyn WindowStore>,
        policy: PolicyHandle,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
    ) -> Self {
        let keys = KeyHierarchyService::new(key_repo, policy.clone(), clock.clone(), audit.clone());
        let sessions = SessionManager::new(session_repo, policy.clone(), clock.clone(), audit.clone());
        let admission = AdmissionControl::new(
            RequestValidator::new(policy.clone()),
            RateLimiter::new(windows, policy.clone(), clock.clone()),
            policy.clone(),
            audit.clone(),
        );

        Self {
            keys,
            sessions,
            admission,
            policy,
            audit,
            clock,
        }
    }

    /// One pass of background maintenance: stale sessions, expired keys and
    /// closed rate windows. Failures are logged and do not stop later steps.
    pub async fn run_maintenance(&self) {
        match self.sessions.sweep_expired().await {
            Ok(count) => tracing::debug!(count, "Session sweep completed"),
            Err(e) => tracing::error!("❌ Session sweep failed: {}", e),
        }

        match self.keys.cleanup_expired_keys().await {
            Ok(count) => tracing::debug!(count, "Expired key cleanup completed"),
            Err(e) => tracing::error!("❌ Expired key cleanup failed: {}", e),
        }

        match self.admission.limiter().purge_expired_windows().await {
            Ok(count) => tracing::debug!(count, "Rate window purge completed"),
            Err(e) => tracing::error!("❌ Rate window purge failed: {}", e),
        }
    }
}
