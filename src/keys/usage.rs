//! Background usage accounting.
//!
//! Increments are queued to a single worker task so the caller's success path
//! never waits on the store. Failed increments are logged and dropped:
//! undercounting is acceptable, failing a successful call is not.

use crate::keys::overrides::OverrideSettings;
use crate::keys::record::{CredentialOrigin, CredentialRecord, Provider};
use crate::keys::store::CredentialStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum UsageJob {
    Record {
        id: String,
        alias: String,
        provider: Provider,
        origin: CredentialOrigin,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<UsageJob>,
}

impl UsageRecorder {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn CredentialStore>, overrides: Arc<OverrideSettings>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, store, overrides));
        Self { tx }
    }

    /// Queue one successful use of `record`. Returns immediately.
    pub fn record_usage(&self, record: &CredentialRecord) {
        let job = UsageJob::Record {
            id: record.id.clone(),
            alias: record.alias.clone(),
            provider: record.provider,
            origin: record.origin,
        };
        if self.tx.send(job).is_err() {
            tracing::warn!(alias = %record.alias, "usage worker stopped, dropping increment");
        }
    }

    /// Wait until every increment queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(UsageJob::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<UsageJob>,
    store: Arc<dyn CredentialStore>,
    overrides: Arc<OverrideSettings>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            UsageJob::Record {
                id,
                alias,
                provider,
                origin,
            } => match origin {
                CredentialOrigin::Store => {
                    if let Err(error) = store.increment_usage(&id, Utc::now()).await {
                        tracing::warn!(%provider, %alias, %error, "failed to update usage stats");
                    }
                }
                CredentialOrigin::Override => match overrides.increment_usage().await {
                    Ok(Some(usage)) => tracing::debug!(%provider, usage, "local key usage updated"),
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(%provider, %error, "failed to persist local key usage")
                    }
                },
                CredentialOrigin::Fallback => {}
            },
            UsageJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("usage worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::overrides::ManualOverride;
    use crate::keys::record::{NewCredential, Secret};
    use crate::keys::store::MemoryCredentialStore;

    #[tokio::test]
    async fn store_keys_are_incremented_in_background() {
        let store = Arc::new(MemoryCredentialStore::new());
        let key = store
            .add_key(NewCredential::new(Provider::Google, Secret::new("a")))
            .await
            .unwrap();
        let recorder = UsageRecorder::spawn(store.clone(), Arc::new(OverrideSettings::in_memory()));

        recorder.record_usage(&key);
        recorder.record_usage(&key);
        recorder.flush().await;

        let stored = store.get(&key.id).await.unwrap();
        assert_eq!(stored.usage_count, 2);
        assert!(stored.last_used.is_some());
    }

    #[tokio::test]
    async fn override_usage_stays_local() {
        let store = Arc::new(MemoryCredentialStore::new());
        let overrides = Arc::new(OverrideSettings::in_memory());
        overrides
            .set(ManualOverride::new(Secret::new("mine"), Provider::Google))
            .await
            .unwrap();
        let recorder = UsageRecorder::spawn(store.clone(), overrides.clone());

        let record = overrides.record_for(Provider::Google).unwrap();
        recorder.record_usage(&record);
        recorder.flush().await;

        assert_eq!(overrides.usage(), 1);
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_records_do_not_stop_the_worker() {
        let store = Arc::new(MemoryCredentialStore::new());
        let recorder = UsageRecorder::spawn(store.clone(), Arc::new(OverrideSettings::in_memory()));
        let ghost = NewCredential::new(Provider::Google, Secret::new("a"))
            .into_record("ghost".into(), Utc::now());
        let real = store
            .add_key(NewCredential::new(Provider::Google, Secret::new("b")))
            .await
            .unwrap();

        recorder.record_usage(&ghost);
        recorder.record_usage(&real);
        recorder.flush().await;

        assert_eq!(store.get(&real.id).await.unwrap().usage_count, 1);
    }
}
