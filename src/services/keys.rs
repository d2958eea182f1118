//! Envelope-encryption key hierarchy.
//!
//! ```text
//! master  (PBKDF2(passphrase), wrapped by itself)
//!   └─ session  (random, wrapped by master, expires after the key TTL)
//!        └─ data  (random, wrapped by session, inherits its expiry)
//! ```
//!
//! Unwrapped keys live only in the [`KeyCache`] and are zeroized when evicted.

use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::Clock;
use crate::config::PolicyHandle;
use crate::crypto::aes::{self, SecureKey};
use crate::crypto::kdf;
use crate::crypto::key_cache::KeyCache;
use crate::error::{AppError, Result};
use crate::models::key::{EncryptedEnvelope, EncryptionKey, KeyType};
use crate::repositories::KeyRepository;

/// Longest parent chain walked while unwrapping (data → session → master).
const MAX_HIERARCHY_DEPTH: usize = 3;

/// Derives, wraps and uses keys on behalf of their owners.
#[derive(Clone)]
pub struct KeyHierarchyService {
    repo: Arc<dyn KeyRepository>,
    cache: KeyCache,
    owner_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    policy: PolicyHandle,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
}

impl KeyHierarchyService {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        policy: PolicyHandle,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
    ) -> Self {
        Self {
            repo,
            cache: KeyCache::new(),
            owner_locks: Arc::new(DashMap::new()),
            policy,
            clock,
            audit,
        }
    }

    fn owner_lock(&self, owner_id: Uuid) -> Arc<Mutex<()>> {
        self.owner_locks
            .entry(owner_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fails with `LimitExceeded` once an owner holds `max_keys_per_owner` active keys.
    /// Must be called with the owner's lock held.
    async fn ensure_quota(&self, owner_id: Uuid) -> Result<()> {
        let max = self.policy.snapshot().keys.max_keys_per_owner;
        let active = self.repo.count_active_by_owner(owner_id).await?;
        if active >= max {
            tracing::warn!(%owner_id, active, max, "Key quota reached");
            return Err(AppError::LimitExceeded(format!(
                "Owner already holds the maximum of {} active keys",
                max
            )));
        }
        Ok(())
    }

    /// Derives a master key from `passphrase` and stores it wrapped by itself.
    pub async fn generate_master_key(&self, owner_id: Uuid, passphrase: &str) -> Result<EncryptionKey> {
        if passphrase.is_empty() {
            return Err(AppError::Validation("Passphrase cannot be empty".to_string()));
        }

        let iterations = self.policy.snapshot().keys.pbkdf2_iterations;
        let salt = kdf::generate_salt()?;
        let key = derive_off_thread(passphrase, salt.to_vec(), iterations).await?;
        let (wrapped, iv) = aes::wrap_key(&key, &key)?;

        let lock = self.owner_lock(owner_id);
        let _guard = lock.lock().await;
        self.ensure_quota(owner_id).await?;

        let record = EncryptionKey {
            id: Uuid::new_v4(),
            owner_id,
            key_type: KeyType::Master,
            parent_key_id: None,
            wrapped_key_bytes: wrapped,
            iv: iv.to_vec(),
            salt: Some(salt.to_vec()),
            kdf_iterations: Some(i32::try_from(iterations).unwrap_or(i32::MAX)),
            created_at: self.clock.now(),
            expires_at: None,
            active: true,
        };

        self.repo.insert(&record).await.inspect_err(|e| {
            tracing::error!(%owner_id, error = %e, "Failed to persist master key");
        })?;
        self.cache.insert(record.id, key).await;

        tracing::info!(key_id = %record.id, %owner_id, "🔑 Master key generated");
        self.audit.record(AuditEvent::KeyGenerated {
            key_id: record.id,
            owner_id,
            key_type: KeyType::Master,
        });
        Ok(record)
    }

    /// Re-derives a stored master key from its passphrase and makes it usable again.
    ///
    /// A wrong passphrase fails with `Integrity`: the derived key cannot open the
    /// self-wrapped bytes.
    pub async fn unlock_master_key(&self, master_key_id: Uuid, passphrase: &str) -> Result<()> {
        let record = self
            .repo
            .find_by_id(master_key_id)
            .await?
            .filter(|k| k.key_type == KeyType::Master && k.active)
            .ok_or(AppError::KeyNotFound)?;

        let salt = record
            .salt
            .clone()
            .ok_or_else(|| AppError::Encryption("Master key has no derivation salt".to_string()))?;
        let iterations = record
            .kdf_iterations
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| AppError::Encryption("Master key has no iteration count".to_string()))?;

        let derived = derive_off_thread(passphrase, salt, iterations).await?;
        let opened = aes::unwrap_key(&derived, &record.wrapped_key_bytes, &record.iv)?;
        if !bool::from(opened.as_bytes().ct_eq(derived.as_bytes())) {
            return Err(AppError::Integrity);
        }

        self.cache.insert(record.id, opened).await;
        tracing::info!(key_id = %record.id, "🔓 Master key unlocked");
        Ok(())
    }

    /// Drops the unwrapped form of a key from memory. The stored record is untouched.
    pub async fn lock_key(&self, key_id: Uuid) -> bool {
        self.cache.remove(key_id).await
    }

    /// Generates a session key wrapped under `master_key_id`.
    pub async fn generate_session_key(&self, owner_id: Uuid, master_key_id: Uuid) -> Result<EncryptionKey> {
        self.generate_child(owner_id, master_key_id, KeyType::Session).await
    }

    /// Generates a data key wrapped under `session_key_id`.
    pub async fn generate_data_key(&self, owner_id: Uuid, session_key_id: Uuid) -> Result<EncryptionKey> {
        self.generate_child(owner_id, session_key_id, KeyType::Data).await
    }

    async fn generate_child(&self, owner_id: Uuid, parent_id: Uuid, key_type: KeyType) -> Result<EncryptionKey> {
        let now = self.clock.now();
        let parent = self
            .repo
            .find_by_id(parent_id)
            .await?
            .filter(|p| {
                Some(p.key_type) == key_type.parent_type()
                    && p.owner_id == owner_id
                    && p.is_usable(now)
            })
            .ok_or(AppError::MissingParentKey)?;

        let parent_key = match self.resolve(&parent).await {
            Ok(key) => key,
            Err(AppError::KeyNotFound) => return Err(AppError::MissingParentKey),
            Err(e) => return Err(e),
        };

        let lock = self.owner_lock(owner_id);
        let _guard = lock.lock().await;
        self.ensure_quota(owner_id).await?;

        let child = aes::generate_key()?;
        let (wrapped, iv) = aes::wrap_key(&parent_key, &child)?;
        let expires_at = match key_type {
            KeyType::Data => parent.expires_at,
            _ => Some(now + Duration::hours(self.policy.snapshot().keys.session_key_ttl_hours)),
        };

        let record = EncryptionKey {
            id: Uuid::new_v4(),
            owner_id,
            key_type,
            parent_key_id: Some(parent.id),
            wrapped_key_bytes: wrapped,
            iv: iv.to_vec(),
            salt: None,
            kdf_iterations: None,
            created_at: now,
            expires_at,
            active: true,
        };

        self.repo.insert(&record).await.inspect_err(|e| {
            tracing::error!(%owner_id, %key_type, error = %e, "Failed to persist key");
        })?;
        self.cache.insert(record.id, child).await;

        tracing::info!(key_id = %record.id, parent_key_id = %parent.id, %key_type, "🔑 Key generated");
        self.audit.record(AuditEvent::KeyGenerated {
            key_id: record.id,
            owner_id,
            key_type,
        });
        Ok(record)
    }

    /// Encrypts `plaintext` under an active, unexpired key with a fresh IV.
    pub async fn encrypt(&self, plaintext: &[u8], key_id: Uuid) -> Result<EncryptedEnvelope> {
        let now = self.clock.now();
        let record = self
            .repo
            .find_by_id(key_id)
            .await?
            .filter(|k| k.is_usable(now))
            .ok_or(AppError::KeyNotFound)?;

        let key = self.resolve(&record).await?;
        let (ciphertext, iv) = aes::encrypt(&key, plaintext)?;

        tracing::debug!(%key_id, bytes = plaintext.len(), "Payload encrypted");
        Ok(EncryptedEnvelope {
            ciphertext,
            iv: iv.to_vec(),
            key_id,
            algorithm: aes::ALGORITHM.to_string(),
            created_at: now,
        })
    }

    /// Opens an envelope. Expired keys may still decrypt; inactive ones may not.
    pub async fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Zeroizing<Vec<u8>>> {
        if envelope.algorithm != aes::ALGORITHM {
            return Err(AppError::Validation(format!(
                "Unsupported algorithm '{}'",
                envelope.algorithm
            )));
        }

        let record = self
            .repo
            .find_by_id(envelope.key_id)
            .await?
            .filter(|k| k.active)
            .ok_or(AppError::KeyNotFound)?;

        let key = self.resolve(&record).await?;
        aes::decrypt(&key, &envelope.ciphertext, &envelope.iv).inspect_err(|e| {
            if matches!(e, AppError::Integrity) {
                tracing::warn!(key_id = %envelope.key_id, "Envelope failed authentication");
            }
        })
    }

    /// Marks a key inactive. Data already encrypted under it is left as is.
    pub async fn deactivate_key(&self, key_id: Uuid) -> Result<bool> {
        let changed = self.repo.deactivate(key_id).await?;
        self.cache.remove(key_id).await;
        if changed {
            tracing::info!(%key_id, "🗝️ Key deactivated");
            self.audit.record(AuditEvent::KeyDeactivated { key_id });
        }
        Ok(changed)
    }

    /// Deactivates every key of an owner.
    pub async fn deactivate_owner_keys(&self, owner_id: Uuid) -> Result<usize> {
        let ids = self.repo.deactivate_by_owner(owner_id).await?;
        self.cache.remove_all(&ids).await;
        for key_id in &ids {
            self.audit.record(AuditEvent::KeyDeactivated { key_id: *key_id });
        }
        tracing::info!(%owner_id, count = ids.len(), "Owner keys deactivated");
        Ok(ids.len())
    }

    /// Deactivates every key past its `expires_at`.
    pub async fn cleanup_expired_keys(&self) -> Result<usize> {
        let ids = self.repo.deactivate_expired(self.clock.now()).await?;
        self.cache.remove_all(&ids).await;
        for key_id in &ids {
            self.audit.record(AuditEvent::KeyDeactivated { key_id: *key_id });
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "🧹 Expired keys deactivated");
        }
        Ok(ids.len())
    }

    /// Key metadata of an owner, oldest first.
    pub async fn list_keys(&self, owner_id: Uuid) -> Result<Vec<EncryptionKey>> {
        self.repo.list_by_owner(owner_id).await
    }

    pub async fn get_key(&self, key_id: Uuid) -> Result<EncryptionKey> {
        self.repo.find_by_id(key_id).await?.ok_or(AppError::KeyNotFound)
    }

    /// Unwraps `record`, walking up to the nearest cached ancestor.
    ///
    /// An uncached master key is locked and yields `KeyNotFound`.
    async fn resolve(&self, record: &EncryptionKey) -> Result<SecureKey> {
        let mut pending: Vec<EncryptionKey> = Vec::new();
        let mut cursor = record.clone();

        let mut key = loop {
            if let Some(key) = self.cache.get(cursor.id).await {
                break key;
            }
            let Some(parent_id) = cursor.parent_key_id else {
                tracing::debug!(key_id = %cursor.id, "Master key is locked");
                return Err(AppError::KeyNotFound);
            };
            if pending.len() >= MAX_HIERARCHY_DEPTH {
                return Err(AppError::Encryption("Key hierarchy is too deep".to_string()));
            }
            let parent = self
                .repo
                .find_by_id(parent_id)
                .await?
                .ok_or(AppError::KeyNotFound)?;
            pending.push(std::mem::replace(&mut cursor, parent));
        };

        while let Some(child) = pending.pop() {
            key = aes::unwrap_key(&key, &child.wrapped_key_bytes, &child.iv)?;
            if child.active {
                self.cache.insert(child.id, key.clone()).await;
            }
        }
        Ok(key)
    }
}

/// Runs PBKDF2 on the blocking pool so derivation does not stall the runtime.
async fn derive_off_thread(passphrase: &str, salt: Vec<u8>, iterations: u32) -> Result<SecureKey> {
    let passphrase = Zeroizing::new(passphrase.to_string());
    tokio::task::spawn_blocking(move || kdf::derive_key(&passphrase, &salt, iterations))
        .await
        .map_err(|e| AppError::KeyGeneration(format!("KDF task failed: {}", e)))?
}
