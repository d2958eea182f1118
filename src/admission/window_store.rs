use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::error::Result;

/// Identifies one fixed window: the same identifier under a different limit
/// or window length is counted separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub identifier: String,
    pub limit: u32,
    pub window_seconds: u64,
}

impl WindowKey {
    fn redis_key(&self) -> String {
        format!("rate_limit:{}:{}:{}", self.identifier, self.limit, self.window_seconds)
    }
}

/// A fixed-window counter. Volatile; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub identifier: String,
    pub limit: u32,
    pub window_seconds: u64,
    pub count: u64,
    pub window_start: DateTime<Utc>,
}

impl RateLimitWindow {
    fn open(key: &WindowKey, now: DateTime<Utc>) -> Self {
        Self {
            identifier: key.identifier.clone(),
            limit: key.limit,
            window_seconds: key.window_seconds,
            count: 0,
            window_start: now,
        }
    }

    /// When the window closes and the count resets.
    pub fn reset_time(&self) -> DateTime<Utc> {
        self.window_start + window_length(self.window_seconds)
    }

    fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time()
    }
}

/// The longest window a counter may span, in seconds.
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

pub(crate) fn window_length(window_seconds: u64) -> Duration {
    Duration::seconds(window_seconds.min(MAX_WINDOW_SECONDS) as i64)
}

/// Backing storage for rate-limit windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Counts one request against `key` and returns the updated window.
    /// Increment-and-read must be atomic per key.
    async fn hit(&self, key: &WindowKey, now: DateTime<Utc>) -> Result<RateLimitWindow>;

    async fn reset(&self, key: &WindowKey) -> Result<()>;

    /// Drops windows that have closed. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Windows held in process memory.
#[derive(Clone, Default)]
pub struct MemoryWindowStore {
    windows: Arc<DashMap<WindowKey, RateLimitWindow>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(&self, key: &WindowKey, now: DateTime<Utc>) -> Result<RateLimitWindow> {
        // The entry guard holds the shard lock across the read-modify-write.
        let mut window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| RateLimitWindow::open(key, now));
        if window.has_elapsed(now) {
            window.count = 0;
            window.window_start = now;
        }
        window.count += 1;
        Ok(window.value().clone())
    }

    async fn reset(&self, key: &WindowKey) -> Result<()> {
        self.windows.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.has_elapsed(now));
        Ok(before.saturating_sub(self.windows.len()))
    }
}

/// Windows held in Redis as `INCR` counters with a TTL of one window.
#[derive(Clone)]
pub struct RedisWindowStore {
    redis: ConnectionManager,
}

impl RedisWindowStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(&self, key: &WindowKey, now: DateTime<Utc>) -> Result<RateLimitWindow> {
        let redis_key = key.redis_key();
        let mut conn = self.redis.clone();

        let count: u64 = redis::cmd("INCR")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&redis_key)
                .arg(key.window_seconds)
                .query_async(&mut conn)
                .await?;
        }

        let mut ttl: i64 = redis::cmd("TTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        // A counter left without expiry would never reset.
        if ttl < 0 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&redis_key)
                .arg(key.window_seconds)
                .query_async(&mut conn)
                .await?;
            ttl = i64::try_from(key.window_seconds).unwrap_or(i64::MAX);
        }

        let elapsed = i64::try_from(key.window_seconds).unwrap_or(i64::MAX).saturating_sub(ttl);
        Ok(RateLimitWindow {
            identifier: key.identifier.clone(),
            limit: key.limit,
            window_seconds: key.window_seconds,
            count,
            window_start: now - Duration::seconds(elapsed.clamp(0, MAX_WINDOW_SECONDS as i64)),
        })
    }

    async fn reset(&self, key: &WindowKey) -> Result<()> {
        let _: () = redis::cmd("DEL")
            .arg(key.redis_key())
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        // Redis expires windows on its own.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WindowKey {
        WindowKey {
            identifier: "203.0.113.5".into(),
            limit: 5,
            window_seconds: 60,
        }
    }

    #[tokio::test]
    async fn counts_within_window_and_resets_after() {
        let store = MemoryWindowStore::new();
        let start = Utc::now();

        assert_eq!(store.hit(&key(), start).await.unwrap().count, 1);
        assert_eq!(store.hit(&key(), start + Duration::seconds(59)).await.unwrap().count, 2);

        let reopened = store.hit(&key(), start + Duration::seconds(60)).await.unwrap();
        assert_eq!(reopened.count, 1);
        assert_eq!(reopened.window_start, start + Duration::seconds(60));
    }

    #[tokio::test]
    async fn limit_and_window_are_part_of_the_key() {
        let store = MemoryWindowStore::new();
        let now = Utc::now();
        let other = WindowKey { limit: 10, ..key() };

        store.hit(&key(), now).await.unwrap();
        assert_eq!(store.hit(&other, now).await.unwrap().count, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn purge_drops_only_closed_windows() {
        let store = MemoryWindowStore::new();
        let now = Utc::now();
        let short = WindowKey { window_seconds: 1, ..key() };

        store.hit(&key(), now).await.unwrap();
        store.hit(&short, now).await.unwrap();

        assert_eq!(store.purge_expired(now + Duration::seconds(2)).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
