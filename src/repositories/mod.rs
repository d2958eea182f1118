//! Persistence collaborator.
//!
//! The services only see these traits. `MemoryStore` backs tests and
//! embedded use; the `Pg*` repositories back the deployed binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::key::EncryptionKey;
use crate::models::session::Session;

pub mod key;
pub mod memory;
pub mod session;

pub use key::PgKeyRepository;
pub use memory::MemoryStore;
pub use session::PgSessionRepository;

/// Storage for `encryption_keys`.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn insert(&self, key: &EncryptionKey) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionKey>>;

    /// All keys of an owner ordered by `created_at` ascending.
    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<EncryptionKey>>;

    async fn count_active_by_owner(&self, owner_id: Uuid) -> Result<usize>;

    /// Soft-deletes one key. Returns `false` if it was already inactive or absent.
    async fn deactivate(&self, id: Uuid) -> Result<bool>;

    /// Soft-deletes every active key of an owner, returning their ids.
    async fn deactivate_by_owner(&self, owner_id: Uuid) -> Result<Vec<Uuid>>;

    /// Soft-deletes every active key whose `expires_at` is before `now`, returning their ids.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

/// Storage for `user_sessions`.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>>;

    /// Writes back tokens, `last_activity` and `active`.
    async fn update(&self, session: &Session) -> Result<()>;

    async fn touch(&self, id: Uuid, last_activity: DateTime<Utc>) -> Result<()>;

    /// Active sessions of a user ordered by `created_at` ascending.
    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Returns `false` if the session was already inactive or absent.
    async fn deactivate(&self, id: Uuid) -> Result<bool>;

    /// Deactivates sessions past `expires_at` or idle since before `idle_cutoff`.
    async fn deactivate_stale(
        &self,
        now: DateTime<Utc>,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    async fn count_active(&self) -> Result<usize>;
}
