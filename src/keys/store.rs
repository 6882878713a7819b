//! Storage seams for credentials and the rotation log.

use crate::error::StoreError;
use crate::keys::record::{CredentialRecord, KeyStatus, NewCredential, Provider, RotationEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Persisted credential records.
///
/// There is no version check between reading a record and updating it; two
/// sessions can both observe a key as active and both mark it exhausted.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Active records for `provider`, ordered by `usage_count` ascending.
    async fn query_active(&self, provider: Provider) -> Result<Vec<CredentialRecord>, StoreError>;

    async fn set_status(&self, id: &str, status: KeyStatus) -> Result<(), StoreError>;

    /// Atomically add one to `usage_count` and stamp `last_used`.
    async fn increment_usage(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn add_key(&self, key: NewCredential) -> Result<CredentialRecord, StoreError>;

    /// Every record regardless of status, newest first.
    async fn list_keys(&self) -> Result<Vec<CredentialRecord>, StoreError>;

    async fn delete_key(&self, id: &str) -> Result<(), StoreError>;
}

/// Append-only sink for rotation events.
#[async_trait]
pub trait RotationLog: Send + Sync {
    async fn append(&self, event: RotationEvent) -> Result<(), StoreError>;

    /// Most recent events first.
    async fn recent(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError>;
}

/// Process-local store, used for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<Vec<CredentialRecord>>,
    events: RwLock<Vec<RotationEvent>>,
    queries: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, bypassing `add_key` defaults.
    pub async fn insert(&self, record: CredentialRecord) {
        self.records.write().await.push(record);
    }

    pub async fn get(&self, id: &str) -> Option<CredentialRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Number of `query_active` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<RotationEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn query_active(&self, provider: Provider) -> Result<Vec<CredentialRecord>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut active: Vec<CredentialRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.provider == provider && record.status == KeyStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|record| record.usage_count);
        Ok(active)
    }

    async fn set_status(&self, id: &str, status: KeyStatus) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn increment_usage(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.usage_count += 1;
        record.last_used = Some(at);
        Ok(())
    }

    async fn add_key(&self, key: NewCredential) -> Result<CredentialRecord, StoreError> {
        let record = key.into_record(uuid::Uuid::new_v4().to_string(), Utc::now());
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_keys(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut records = self.records.read().await.clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete_key(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RotationLog for MemoryCredentialStore {
    async fn append(&self, event: RotationEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
