//! Runs upstream calls with automatic key rotation on quota failures.

use crate::config::EngineConfig;
use crate::error::{ExecuteError, KeyError};
use crate::keys::cache::{DEFAULT_CACHE_TTL, KeyCache};
use crate::keys::classifier::{ErrorClassifier, FailureClass, SubstringClassifier};
use crate::keys::overrides::{ManualOverride, OverrideSettings};
use crate::keys::record::{CredentialRecord, Provider, Secret};
use crate::keys::rotation::RotationController;
use crate::keys::selector::{FallbackCredential, KeySelector};
use crate::keys::store::{CredentialStore, RotationLog};
use crate::keys::usage::UsageRecorder;
use futures::stream::{self, BoxStream, Stream, StreamExt as _};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const QUOTA_REASON: &str = "Quota Exceeded";
pub const STREAM_QUOTA_REASON: &str = "Quota Exceeded during Stream";

pub struct KeyExecutorBuilder {
    store: Arc<dyn CredentialStore>,
    log: Arc<dyn RotationLog>,
    overrides: Arc<OverrideSettings>,
    classifier: Arc<dyn ErrorClassifier>,
    fallback: Option<FallbackCredential>,
    cache_ttl: Duration,
    max_attempts: u32,
}

impl KeyExecutorBuilder {
    /// Apply cache, retry, fallback and classifier settings from config.
    pub fn engine_config(self, engine: &EngineConfig) -> Self {
        self.cache_ttl(engine.cache_ttl())
            .max_attempts(engine.max_attempts)
            .fallback(engine.fallback_credential())
            .classifier(Arc::new(SubstringClassifier::new(&engine.quota_patterns)))
    }

    pub fn overrides(mut self, overrides: Arc<OverrideSettings>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn fallback(mut self, fallback: Option<FallbackCredential>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Must be called inside a tokio runtime; spawns the usage worker.
    pub fn build(self) -> KeyExecutor {
        let selector = Arc::new(KeySelector::new(
            self.store.clone(),
            KeyCache::new(self.cache_ttl),
            self.overrides.clone(),
            self.fallback,
        ));
        let rotation = RotationController::new(self.store.clone(), self.log, selector.clone());
        let usage = UsageRecorder::spawn(self.store, self.overrides);

        KeyExecutor {
            selector,
            rotation,
            usage,
            classifier: self.classifier,
            max_attempts: self.max_attempts,
        }
    }
}

/// Wraps outbound provider calls with key selection, rotation and bounded
/// retry. Cheap to share behind an `Arc`; concurrent callers may pick the same
/// key, so usage counts are approximate.
pub struct KeyExecutor {
    selector: Arc<KeySelector>,
    rotation: RotationController,
    usage: UsageRecorder,
    classifier: Arc<dyn ErrorClassifier>,
    max_attempts: u32,
}

impl KeyExecutor {
    pub fn builder(store: Arc<dyn CredentialStore>, log: Arc<dyn RotationLog>) -> KeyExecutorBuilder {
        KeyExecutorBuilder {
            store,
            log,
            overrides: Arc::new(OverrideSettings::in_memory()),
            classifier: Arc::new(SubstringClassifier::default()),
            fallback: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn selector(&self) -> &KeySelector {
        &self.selector
    }

    pub fn overrides(&self) -> &Arc<OverrideSettings> {
        self.selector.overrides()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn select_keys(&self, provider: Provider) -> Vec<CredentialRecord> {
        self.selector.select_keys(provider).await
    }

    /// Install a local override key and drop every cached key list.
    pub async fn set_override(&self, value: ManualOverride) -> anyhow::Result<()> {
        self.overrides().set(value).await?;
        self.selector.cache().clear().await;
        Ok(())
    }

    pub async fn clear_override(&self) -> anyhow::Result<()> {
        self.overrides().clear().await?;
        self.selector.cache().clear().await;
        Ok(())
    }

    /// Wait for queued usage increments to land.
    pub async fn flush_usage(&self) {
        self.usage.flush().await;
    }

    /// Call `operation` with the best available key for `provider`, rotating
    /// to the next key whenever it fails with a quota error.
    ///
    /// Non-quota errors are returned as-is after a single attempt.
    pub async fn execute_with_rotation<T, E, F, Fut>(
        &self,
        provider: Provider,
        mut operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut(Secret) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempts = 0;
        while attempts < self.max_attempts {
            let candidate = self.next_candidate(provider).await?;

            match operation(candidate.secret.clone()).await {
                Ok(value) => {
                    self.usage.record_usage(&candidate);
                    return Ok(value);
                }
                Err(error) => {
                    if !self.should_rotate(&candidate, &error) {
                        return Err(ExecuteError::Upstream(error));
                    }
                    self.rotation.rotate(&candidate, QUOTA_REASON).await;
                    attempts += 1;
                }
            }
        }

        tracing::error!(%provider, attempts, "giving up after repeated quota failures");
        Err(KeyError::RetriesExhausted { provider, attempts }.into())
    }

    /// Streaming variant of [`execute_with_rotation`](Self::execute_with_rotation).
    ///
    /// Rotation is only possible until the stream produces its first item.
    /// After that the stream belongs to the caller and later errors are
    /// yielded without retry.
    pub async fn execute_stream_with_rotation<T, E, F, Fut, S>(
        &self,
        provider: Provider,
        mut open: F,
    ) -> Result<BoxStream<'static, Result<T, E>>, ExecuteError<E>>
    where
        F: FnMut(Secret) -> Fut,
        Fut: Future<Output = Result<S, E>>,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut attempts = 0;
        while attempts < self.max_attempts {
            let candidate = self.next_candidate(provider).await?;

            let opened = match open(candidate.secret.clone()).await {
                Ok(stream) => start_stream(stream).await,
                Err(error) => Err(error),
            };

            match opened {
                Ok(stream) => {
                    self.usage.record_usage(&candidate);
                    return Ok(stream);
                }
                Err(error) => {
                    if !self.should_rotate(&candidate, &error) {
                        return Err(ExecuteError::Upstream(error));
                    }
                    self.rotation.rotate(&candidate, STREAM_QUOTA_REASON).await;
                    attempts += 1;
                }
            }
        }

        tracing::error!(%provider, attempts, "giving up on stream after repeated quota failures");
        Err(KeyError::RetriesExhausted { provider, attempts }.into())
    }

    async fn next_candidate(&self, provider: Provider) -> Result<CredentialRecord, KeyError> {
        match self.selector.select_keys(provider).await.into_iter().next() {
            Some(candidate) => Ok(candidate),
            None if !self.overrides().is_configured() => Err(KeyError::MissingApiKey { provider }),
            None => Err(KeyError::NoActiveKeys { provider }),
        }
    }

    fn should_rotate<E: fmt::Display>(&self, candidate: &CredentialRecord, error: &E) -> bool {
        let message = format!("{error:#}");
        let class = self.classifier.classify(candidate.provider, &message);
        tracing::warn!(
            provider = %candidate.provider,
            alias = %candidate.alias,
            error = %message,
            ?class,
            "upstream call failed"
        );
        class == FailureClass::Quota
    }
}

/// Pull the first item so a quota failure at stream start can still rotate.
async fn start_stream<T, E, S>(inner: S) -> Result<BoxStream<'static, Result<T, E>>, E>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut inner = Box::pin(inner);
    match inner.next().await {
        Some(Ok(first)) => Ok(stream::once(async move { Ok(first) }).chain(inner).boxed()),
        Some(Err(error)) => Err(error),
        None => Ok(stream::empty().boxed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::record::{KeyStatus, NewCredential};
    use crate::keys::store::MemoryCredentialStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn executor_with_keys(aliases: &[&str]) -> (Arc<MemoryCredentialStore>, KeyExecutor) {
        let store = Arc::new(MemoryCredentialStore::new());
        for alias in aliases {
            store
                .add_key(
                    NewCredential::new(Provider::Google, Secret::new(format!("secret-{alias}")))
                        .alias(*alias),
                )
                .await
                .unwrap();
        }
        let executor = KeyExecutor::builder(store.clone(), store.clone()).build();
        (store, executor)
    }

    #[tokio::test]
    async fn empty_store_without_override_is_missing_key() {
        let (_, executor) = executor_with_keys(&[]).await;
        let result = executor
            .execute_with_rotation(Provider::Google, |_| async { Ok::<_, String>(()) })
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Key(KeyError::MissingApiKey { provider: Provider::Google }))
        ));
    }

    #[tokio::test]
    async fn override_for_other_provider_reports_no_active_keys() {
        let (_, executor) = executor_with_keys(&[]).await;
        executor
            .set_override(ManualOverride::new(Secret::new("local"), Provider::OpenAi))
            .await
            .unwrap();

        let result = executor
            .execute_with_rotation(Provider::Google, |_| async { Ok::<_, String>(()) })
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Key(KeyError::NoActiveKeys { provider: Provider::Google }))
        ));
    }

    #[tokio::test]
    async fn blank_override_reports_missing_key() {
        let (_, executor) = executor_with_keys(&[]).await;
        executor
            .set_override(ManualOverride::new(Secret::new("  \t"), Provider::Google))
            .await
            .unwrap();

        let result = executor
            .execute_with_rotation(Provider::Google, |_| async { Ok::<_, String>(()) })
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Key(KeyError::MissingApiKey { provider: Provider::Google }))
        ));
    }

    #[tokio::test]
    async fn rotation_moves_to_next_secret() {
        let (store, executor) = executor_with_keys(&["Primary", "Backup"]).await;
        let seen = std::sync::Mutex::new(Vec::new());

        let result = executor
            .execute_with_rotation(Provider::Google, |secret| {
                seen.lock().unwrap().push(secret.expose().to_string());
                let fail = secret.expose() == "secret-Primary";
                async move {
                    if fail {
                        Err("RESOURCE_EXHAUSTED: quota exceeded".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(*seen.lock().unwrap(), ["secret-Primary", "secret-Backup"]);
        let keys = store.list_keys().await.unwrap();
        let primary = keys.iter().find(|k| k.alias == "Primary").unwrap();
        assert_eq!(primary.status, KeyStatus::Exhausted);
    }

    #[tokio::test]
    async fn stream_rotates_before_first_item() {
        let (store, executor) = executor_with_keys(&["Primary", "Backup"]).await;

        let stream = executor
            .execute_stream_with_rotation(Provider::Google, |secret| async move {
                if secret.expose() == "secret-Primary" {
                    let items: Vec<Result<String, String>> = vec![Err("429 Too Many Requests".into())];
                    Ok::<_, String>(stream::iter(items))
                } else {
                    let items: Vec<Result<String, String>> = vec![Ok("Hel".into()), Ok("lo".into())];
                    Ok(stream::iter(items))
                }
            })
            .await
            .unwrap();

        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks, [Ok("Hel".to_string()), Ok("lo".to_string())]);

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, STREAM_QUOTA_REASON);
    }

    #[tokio::test]
    async fn stream_errors_after_first_item_pass_through() {
        let (store, executor) = executor_with_keys(&["Primary", "Backup"]).await;
        let opens = AtomicU32::new(0);

        let stream = executor
            .execute_stream_with_rotation(Provider::Google, |_| {
                opens.fetch_add(1, Ordering::SeqCst);
                async {
                    let items: Vec<Result<String, String>> =
                        vec![Ok("partial".into()), Err("429 quota".into())];
                    Ok::<_, String>(stream::iter(items))
                }
            })
            .await
            .unwrap();

        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks, [Ok("partial".to_string()), Err("429 quota".to_string())]);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(store.events().await.is_empty());

        executor.flush_usage().await;
        let used: u64 = store.list_keys().await.unwrap().iter().map(|k| k.usage_count).sum();
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn max_attempts_is_configurable() {
        let store = Arc::new(MemoryCredentialStore::new());
        for n in 0..3 {
            store
                .add_key(NewCredential::new(Provider::Google, Secret::new(format!("k{n}"))))
                .await
                .unwrap();
        }
        let executor = KeyExecutor::builder(store.clone(), store.clone())
            .max_attempts(2)
            .build();
        assert_eq!(executor.max_attempts(), 2);

        let result = executor
            .execute_with_rotation(Provider::Google, |_| async { Err::<(), _>("quota") })
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Key(KeyError::RetriesExhausted { attempts: 2, .. }))
        ));
        assert_eq!(store.events().await.len(), 2);
    }
}
