use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crypto::aes::SecureKey;

/// A cache of unwrapped keys, keyed by key id.
///
/// Master keys only ever become usable through this cache: their stored form
/// is self-wrapped and cannot be opened without the passphrase.
#[derive(Clone, Default)]
pub struct KeyCache {
    cache: Arc<RwLock<HashMap<Uuid, SecureKey>>>,
}

impl KeyCache {
    /// Creates a new `KeyCache`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a key from the cache by id.
    pub async fn get(&self, key_id: Uuid) -> Option<SecureKey> {
        let cache = self.cache.read().await;
        cache.get(&key_id).cloned()
    }

    /// Inserts a key into the cache.
    pub async fn insert(&self, key_id: Uuid, key: SecureKey) {
        let mut cache = self.cache.write().await;
        cache.insert(key_id, key);
    }

    /// Removes a key from the cache. The evicted key is zeroized on drop.
    pub async fn remove(&self, key_id: Uuid) -> bool {
        let mut cache = self.cache.write().await;
        cache.remove(&key_id).is_some()
    }

    /// Removes every key in `key_ids`.
    pub async fn remove_all(&self, key_ids: &[Uuid]) {
        let mut cache = self.cache.write().await;
        for id in key_ids {
            cache.remove(id);
        }
    }

    /// Returns the number of cached keys.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::generate_key;

    #[tokio::test]
    async fn insert_get_remove() {
        let cache = KeyCache::new();
        let id = Uuid::new_v4();
        let key = generate_key().unwrap();

        cache.insert(id, key.clone()).await;
        assert_eq!(cache.get(id).await.unwrap().as_bytes(), key.as_bytes());
        assert_eq!(cache.len().await, 1);

        assert!(cache.remove(id).await);
        assert!(cache.get(id).await.is_none());
        assert!(!cache.remove(id).await);
    }
}
