use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::key::EncryptionKey;
use crate::models::session::Session;
use crate::repositories::{KeyRepository, SessionRepository};

/// An in-process store implementing both repositories.
#[derive(Clone, Default)]
pub struct MemoryStore {
    keys: Arc<RwLock<HashMap<Uuid, EncryptionKey>>>,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRepository for MemoryStore {
    async fn insert(&self, key: &EncryptionKey) -> Result<()> {
        self.keys.write().await.insert(key.id, key.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionKey>> {
        Ok(self.keys.read().await.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<EncryptionKey>> {
        let keys = self.keys.read().await;
        let mut owned: Vec<EncryptionKey> = keys
            .values()
            .filter(|k| k.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|k| k.created_at);
        Ok(owned)
    }

    async fn count_active_by_owner(&self, owner_id: Uuid) -> Result<usize> {
        let keys = self.keys.read().await;
        Ok(keys
            .values()
            .filter(|k| k.owner_id == owner_id && k.active)
            .count())
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(&id) {
            Some(key) if key.active => {
                key.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_by_owner(&self, owner_id: Uuid) -> Result<Vec<Uuid>> {
        let mut keys = self.keys.write().await;
        Ok(keys
            .values_mut()
            .filter(|k| k.owner_id == owner_id && k.active)
            .map(|k| {
                k.active = false;
                k.id
            })
            .collect())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut keys = self.keys.write().await;
        Ok(keys
            .values_mut()
            .filter(|k| k.active && k.is_expired(now))
            .map(|k| {
                k.active = false;
                k.id
            })
            .collect())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        self.sessions.write().await.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get_mut(&session.id) {
            stored.session_token = session.session_token.clone();
            stored.refresh_token = session.refresh_token.clone();
            stored.previous_refresh_token = session.previous_refresh_token.clone();
            stored.last_activity = session.last_activity;
            stored.active = session.active;
        }
        Ok(())
    }

    async fn touch(&self, id: Uuid, last_activity: DateTime<Utc>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get_mut(&id) {
            stored.last_activity = stored.last_activity.max(last_activity);
        }
        Ok(())
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id && s.active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.active => {
                session.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_stale(
        &self,
        now: DateTime<Utc>,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .values_mut()
            .filter(|s| s.active && (now > s.expires_at || s.last_activity < idle_cutoff))
            .map(|s| {
                s.active = false;
                s.clone()
            })
            .collect())
    }

    async fn count_active(&self) -> Result<usize> {
        Ok(self.sessions.read().await.values().filter(|s| s.active).count())
    }
}
