use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Keyed cache with per-entry time-to-live. Entries are never invalidated
/// early; a stale value lives until its TTL runs out.
#[async_trait]
pub trait TtlCache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CacheError>;
    async fn insert(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Clone, Debug)]
struct CacheSlot<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryTtlCache<V> {
    entries: RwLock<HashMap<String, CacheSlot<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V> InMemoryTtlCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), clock }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<V> Default for InMemoryTtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> TtlCache<V> for InMemoryTtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(slot) if slot.expires_at > now => return Ok(Some(slot.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it unless a concurrent insert already refreshed it.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|slot| slot.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn insert(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|error| CacheError::Unavailable(format!("ttl out of range: {error}")))?;
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .ok_or_else(|| CacheError::Unavailable("ttl overflows the clock".to_owned()))?;

        self.entries.write().await.insert(key.to_owned(), CacheSlot { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
