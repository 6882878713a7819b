//! Picks the keys a call may use, least used first.

use crate::keys::cache::KeyCache;
use crate::keys::overrides::OverrideSettings;
use crate::keys::record::{CredentialRecord, Provider, Secret};
use crate::keys::store::CredentialStore;
use std::sync::Arc;

/// Last-resort credential used when the store cannot be reached.
#[derive(Debug, Clone)]
pub struct FallbackCredential {
    pub provider: Provider,
    pub secret: Secret,
}

pub struct KeySelector {
    store: Arc<dyn CredentialStore>,
    cache: KeyCache,
    overrides: Arc<OverrideSettings>,
    fallback: Option<FallbackCredential>,
}

impl KeySelector {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cache: KeyCache,
        overrides: Arc<OverrideSettings>,
        fallback: Option<FallbackCredential>,
    ) -> Self {
        Self {
            store,
            cache,
            overrides,
            fallback: fallback.filter(|f| !f.secret.is_empty()),
        }
    }

    pub fn overrides(&self) -> &Arc<OverrideSettings> {
        &self.overrides
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Eligible keys for `provider`, highest priority first.
    ///
    /// An empty list means no usable key; it is not an error.
    pub async fn select_keys(&self, provider: Provider) -> Vec<CredentialRecord> {
        if let Some(record) = self.overrides.record_for(provider) {
            return vec![record];
        }

        if let Some(keys) = self.cache.get(provider).await {
            return keys;
        }

        match self.store.query_active(provider).await {
            Ok(records) => {
                let mut keys: Vec<CredentialRecord> =
                    records.into_iter().filter(CredentialRecord::is_eligible).collect();
                keys.sort_by_key(|record| record.usage_count);
                tracing::debug!(%provider, count = keys.len(), "fetched active keys");
                self.cache.put(provider, keys.clone()).await;
                keys
            }
            Err(error) => {
                tracing::warn!(%provider, %error, "failed to fetch active keys");
                match &self.fallback {
                    Some(fallback) if fallback.provider == provider => {
                        vec![CredentialRecord::fallback(provider, fallback.secret.clone())]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }
}
