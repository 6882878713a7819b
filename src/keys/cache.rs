//! Time-boxed, per-provider cache of eligible keys.

use crate::keys::record::{CredentialRecord, Provider};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    keys: Vec<CredentialRecord>,
    fetched_at: Instant,
}

/// Owned by a single selector; not shared across sessions.
#[derive(Debug)]
pub struct KeyCache {
    ttl: Duration,
    entries: RwLock<HashMap<Provider, CacheEntry>>,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached keys for `provider`, if fetched within the freshness window.
    pub async fn get(&self, provider: Provider) -> Option<Vec<CredentialRecord>> {
        let entries = self.entries.read().await;
        let entry = entries.get(&provider)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.keys.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, provider: Provider, keys: Vec<CredentialRecord>) {
        self.entries.write().await.insert(
            provider,
            CacheEntry {
                keys,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, provider: Provider) {
        if self.entries.write().await.remove(&provider).is_some() {
            tracing::debug!(%provider, "key cache invalidated");
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
