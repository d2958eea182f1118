//! Session lifecycle: create → validate/rotate → expire or invalidate.
//!
//! Active sessions are cached in a `DashMap` in front of the repository.
//! Anything that reads a user's active set and then writes it (cap
//! enforcement, token rotation) holds that user's lock for the duration.

use chrono::Duration;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::Clock;
use crate::config::PolicyHandle;
use crate::crypto::token::{generate_token, tokens_match};
use crate::error::{AppError, Result};
use crate::models::session::{InvalidationReason, NewSession, SecurityLevel, Session};
use crate::repositories::SessionRepository;

/// Process-wide session counters.
#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    invalidated: AtomicU64,
    evicted: AtomicU64,
    rotated: AtomicU64,
}

/// A point-in-time view of session activity.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub cached: usize,
    pub created: u64,
    pub invalidated: u64,
    pub evicted: u64,
    pub rotated: u64,
}

#[derive(Clone)]
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    cache: Arc<DashMap<Uuid, Session>>,
    user_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    counters: Arc<Counters>,
    policy: PolicyHandle,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        policy: PolicyHandle,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
    ) -> Self {
        Self {
            repo,
            cache: Arc::new(DashMap::new()),
            user_locks: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            policy,
            clock,
            audit,
        }
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates a session for an already-authenticated user.
    ///
    /// When the user is at the concurrency cap, their oldest sessions are
    /// evicted to make room; creation is never refused for that reason.
    pub async fn create_session(&self, input: NewSession) -> Result<Session> {
        let policy = self.policy.snapshot();
        if !policy.ip_access.permits(&input.ip) {
            tracing::warn!(user_id = %input.user_id, ip = %input.ip, "❌ Session refused for IP");
            return Err(AppError::IpNotAllowed(input.ip));
        }

        let lock = self.user_lock(input.user_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();
        let idle_timeout = Duration::minutes(policy.session.idle_timeout_min);

        let mut active = Vec::new();
        for session in self.repo.list_active_by_user(input.user_id).await? {
            if session.is_expired(now) {
                self.terminate(&session, InvalidationReason::AbsoluteExpiry).await?;
            } else if session.is_idle(now, idle_timeout) {
                self.terminate(&session, InvalidationReason::IdleTimeout).await?;
            } else {
                active.push(session);
            }
        }

        let max_concurrent = policy.session.max_concurrent as usize;
        let overflow = (active.len() + 1).saturating_sub(max_concurrent);
        for oldest in active.drain(..overflow) {
            tracing::info!(
                session_id = %oldest.id,
                user_id = %oldest.user_id,
                "Evicting oldest session at concurrency cap"
            );
            self.terminate(&oldest, InvalidationReason::ConcurrencyEviction).await?;
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }

        let lifetime = if input.remember_me {
            Duration::minutes(policy.session.remember_duration_days * 1440)
        } else {
            Duration::minutes(policy.session.session_timeout_min)
        };

        let session = Session {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            session_token: generate_token()?,
            refresh_token: generate_token()?,
            previous_refresh_token: None,
            ip: input.ip,
            user_agent: input.user_agent,
            created_at: now,
            last_activity: now,
            expires_at: now + lifetime,
            active: true,
            remembered: input.remember_me,
            security_level: if input.mfa_verified {
                SecurityLevel::High
            } else {
                SecurityLevel::Medium
            },
            mfa_verified: input.mfa_verified,
            concurrent_count: i32::try_from(active.len() + 1).unwrap_or(i32::MAX),
            max_concurrent: i32::try_from(max_concurrent).unwrap_or(i32::MAX),
        };

        self.repo.insert(&session).await.inspect_err(|e| {
            tracing::error!(user_id = %session.user_id, error = %e, "Failed to persist session");
        })?;
        self.cache.insert(session.id, session.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(session_id = %session.id, user_id = %session.user_id, "✅ Session created");
        self.audit.record(AuditEvent::SessionCreated {
            session_id: session.id,
            user_id: session.user_id,
            ip: session.ip.clone(),
        });
        Ok(session)
    }

    /// Returns the session if `token` is current and neither expiry has passed.
    ///
    /// Never fails: any problem, including a storage error, means "no session".
    /// A successful check slides the idle window forward.
    pub async fn validate_session(&self, id: Uuid, token: &str) -> Option<Session> {
        let session = self.load(id).await?;

        if !session.active || !tokens_match(token, &session.session_token) {
            tracing::debug!(session_id = %id, "Session token rejected");
            return None;
        }

        let now = self.clock.now();
        let idle_timeout = Duration::minutes(self.policy.snapshot().session.idle_timeout_min);
        let expired = if session.is_expired(now) {
            Some(InvalidationReason::AbsoluteExpiry)
        } else if session.is_idle(now, idle_timeout) {
            Some(InvalidationReason::IdleTimeout)
        } else {
            None
        };
        if let Some(reason) = expired {
            tracing::debug!(session_id = %id, %reason, "Session expired on access");
            if let Err(e) = self.terminate(&session, reason).await {
                tracing::error!(session_id = %id, error = %e, "Failed to invalidate expired session");
            }
            return None;
        }

        let touched = match self.cache.get_mut(&id) {
            Some(mut cached) => {
                if cached.last_activity < now {
                    cached.last_activity = now;
                }
                cached.value().clone()
            }
            // Invalidated concurrently.
            None => {
                tracing::debug!(session_id = %id, "Session invalidated during validation");
                return None;
            }
        };

        if let Err(e) = self.repo.touch(id, now).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to persist last_activity");
        }
        Some(touched)
    }

    /// Rotates both tokens. `expires_at` and identity are preserved.
    pub async fn refresh_session(&self, id: Uuid, refresh_token: &str) -> Option<Session> {
        let current = self.load(id).await?;
        let lock = self.user_lock(current.user_id);
        let _guard = lock.lock().await;

        // Re-read under the lock so two concurrent refreshes cannot both rotate.
        self.cache.remove(&id);
        let mut session = self.load(id).await?;
        if !session.active {
            return None;
        }

        if !tokens_match(refresh_token, &session.refresh_token) {
            let replayed = session
                .previous_refresh_token
                .as_deref()
                .is_some_and(|previous| tokens_match(refresh_token, previous));
            if replayed && self.policy.snapshot().session.detect_refresh_reuse {
                tracing::warn!(session_id = %id, user_id = %session.user_id, "🚨 Rotated refresh token replayed");
                self.audit.record(AuditEvent::RefreshTokenReuse {
                    session_id: id,
                    user_id: session.user_id,
                });
                if let Err(e) = self.terminate(&session, InvalidationReason::RefreshTokenReuse).await {
                    tracing::error!(session_id = %id, error = %e, "Failed to revoke session after reuse");
                }
            }
            return None;
        }

        let now = self.clock.now();
        let idle_timeout = Duration::minutes(self.policy.snapshot().session.idle_timeout_min);
        let expired = if session.is_expired(now) {
            Some(InvalidationReason::AbsoluteExpiry)
        } else if session.is_idle(now, idle_timeout) {
            Some(InvalidationReason::IdleTimeout)
        } else {
            None
        };
        if let Some(reason) = expired {
            tracing::debug!(session_id = %id, %reason, "Session expired before refresh");
            if let Err(e) = self.terminate(&session, reason).await {
                tracing::error!(session_id = %id, error = %e, "Failed to invalidate expired session");
            }
            return None;
        }

        let (Ok(new_session_token), Ok(new_refresh_token)) = (generate_token(), generate_token()) else {
            tracing::error!(session_id = %id, "Token generation failed during rotation");
            return None;
        };
        session.previous_refresh_token = Some(std::mem::replace(&mut session.refresh_token, new_refresh_token));
        session.session_token = new_session_token;
        session.last_activity = now;

        if let Err(e) = self.repo.update(&session).await {
            tracing::error!(session_id = %id, error = %e, "Failed to persist rotated tokens");
            return None;
        }
        self.cache.insert(id, session.clone());
        self.counters.rotated.fetch_add(1, Ordering::Relaxed);

        tracing::info!(session_id = %id, user_id = %session.user_id, "🔄 Session tokens rotated");
        self.audit.record(AuditEvent::SessionRotated {
            session_id: id,
            user_id: session.user_id,
        });
        Some(session)
    }

    /// Soft-invalidates one session.
    pub async fn invalidate_session(&self, id: Uuid) -> Result<bool> {
        match self.load(id).await {
            Some(session) if session.active => self.terminate(&session, InvalidationReason::Logout).await,
            _ => {
                self.cache.remove(&id);
                Ok(false)
            }
        }
    }

    /// Soft-invalidates every active session of a user except `except`.
    pub async fn invalidate_all_user_sessions(&self, user_id: Uuid, except: Option<Uuid>) -> Result<usize> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut count = 0;
        for session in self.repo.list_active_by_user(user_id).await? {
            if Some(session.id) == except {
                continue;
            }
            if self.terminate(&session, InvalidationReason::Revoked).await? {
                count += 1;
            }
        }
        tracing::info!(%user_id, count, "Sessions revoked");
        Ok(count)
    }

    /// Active sessions of a user, oldest first.
    pub async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.repo.list_active_by_user(user_id).await
    }

    /// Invalidates every session past its absolute expiry or idle window.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let idle_cutoff = now - Duration::minutes(self.policy.snapshot().session.idle_timeout_min);

        let stale = self.repo.deactivate_stale(now, idle_cutoff).await?;
        for session in &stale {
            self.cache.remove(&session.id);
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            self.audit.record(AuditEvent::SessionInvalidated {
                session_id: session.id,
                user_id: session.user_id,
                reason: InvalidationReason::Sweep,
            });
        }

        // Entries whose row vanished or was deactivated elsewhere.
        self.cache
            .retain(|_, s| s.active && now <= s.expires_at && s.last_activity >= idle_cutoff);

        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "🧹 Stale sessions invalidated");
        }
        Ok(stale.len())
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        Ok(SessionStats {
            active: self.repo.count_active().await?,
            cached: self.cache.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            rotated: self.counters.rotated.load(Ordering::Relaxed),
        })
    }

    async fn load(&self, id: Uuid) -> Option<Session> {
        if let Some(cached) = self.cache.get(&id) {
            return Some(cached.value().clone());
        }
        match self.repo.find_by_id(id).await {
            Ok(Some(session)) => {
                if session.active {
                    self.cache.insert(id, session.clone());
                }
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Session lookup failed");
                None
            }
        }
    }

    async fn terminate(&self, session: &Session, reason: InvalidationReason) -> Result<bool> {
        self.cache.remove(&session.id);
        let changed = self.repo.deactivate(session.id).await?;
        if changed {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            tracing::info!(session_id = %session.id, user_id = %session.user_id, %reason, "Session invalidated");
            self.audit.record(AuditEvent::SessionInvalidated {
                session_id: session.id,
                user_id: session.user_id,
                reason,
            });
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityPolicy;
    use crate::repositories::MemoryStore;
    use chrono::{DateTime, Utc};

    type Hook = Box<dyn FnOnce() + Send>;

    /// Runs `hook` the next time the time is read, then behaves as a frozen clock.
    struct InterleavingClock {
        now: DateTime<Utc>,
        hook: std::sync::Mutex<Option<Hook>>,
    }

    impl Clock for InterleavingClock {
        fn now(&self) -> DateTime<Utc> {
            if let Some(hook) = self.hook.lock().unwrap().take() {
                hook();
            }
            self.now
        }
    }

    #[tokio::test]
    async fn validate_refuses_session_invalidated_mid_check() {
        let store: Arc<dyn SessionRepository> = Arc::new(MemoryStore::new());
        let clock = Arc::new(InterleavingClock {
            now: Utc::now(),
            hook: std::sync::Mutex::new(None),
        });
        let manager = SessionManager::new(
            store.clone(),
            PolicyHandle::new(SecurityPolicy::default()).unwrap(),
            clock.clone(),
            AuditLog::default(),
        );
        let session = manager
            .create_session(NewSession {
                user_id: Uuid::new_v4(),
                ip: "203.0.113.30".to_string(),
                user_agent: "unit-test".to_string(),
                remember_me: false,
                mfa_verified: false,
            })
            .await
            .unwrap();

        // Another task logs the session out after the token check has passed.
        let cache = manager.cache.clone();
        let id = session.id;
        *clock.hook.lock().unwrap() = Some(Box::new(move || {
            cache.remove(&id);
            let deactivated = futures::executor::block_on(store.deactivate(id)).unwrap();
            assert!(deactivated);
        }));

        assert!(manager.validate_session(session.id, &session.session_token).await.is_none());
        assert!(manager.validate_session(session.id, &session.session_token).await.is_none());
    }
}
