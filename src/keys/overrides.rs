//! Operator-supplied local override key.
//!
//! When set, the override is the only key handed out for its provider. It is
//! never written to the credential store; its usage counter lives in a small
//! JSON file next to the rest of the local state, and every increment is
//! published on a watch channel so status views can refresh.

use crate::keys::record::{CredentialOrigin, CredentialRecord, KeyStatus, OVERRIDE_KEY_ID, Provider, Secret};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

const OVERRIDE_ALIAS: &str = "My Active Key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub secret: Secret,
    pub provider: Provider,
    #[serde(default)]
    pub usage: u64,
    pub created_at: DateTime<Utc>,
}

impl ManualOverride {
    pub fn new(secret: Secret, provider: Provider) -> Self {
        Self {
            secret,
            provider,
            usage: 0,
            created_at: Utc::now(),
        }
    }

    pub fn to_record(&self) -> CredentialRecord {
        CredentialRecord {
            id: OVERRIDE_KEY_ID.into(),
            provider: self.provider,
            secret: self.secret.clone(),
            alias: OVERRIDE_ALIAS.into(),
            status: KeyStatus::Active,
            usage_count: self.usage,
            usage_limit: u64::MAX,
            last_used: Some(Utc::now()),
            added_by: "local".into(),
            created_at: self.created_at,
            origin: CredentialOrigin::Override,
        }
    }
}

pub struct OverrideSettings {
    current: RwLock<Option<ManualOverride>>,
    path: Option<PathBuf>,
    usage_tx: watch::Sender<u64>,
}

impl OverrideSettings {
    /// Settings that live only in memory.
    pub fn in_memory() -> Self {
        Self::with_state(None, None)
    }

    /// Load settings persisted at `path`; a missing file means no override.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Some(
                serde_json::from_str::<ManualOverride>(&contents)
                    .with_context(|| format!("failed to parse override file {}", path.display()))?,
            ),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read override file {}", path.display()));
            }
        };
        Ok(Self::with_state(current, Some(path)))
    }

    fn with_state(current: Option<ManualOverride>, path: Option<PathBuf>) -> Self {
        let usage = current.as_ref().map_or(0, |o| o.usage);
        let (usage_tx, _) = watch::channel(usage);
        Self {
            current: RwLock::new(current),
            path,
            usage_tx,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Synchronous snapshot, safe to call on the selection path.
    pub fn current(&self) -> Option<ManualOverride> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// An override with a blank secret counts as absent.
    pub fn is_configured(&self) -> bool {
        self.current().is_some_and(|o| !o.secret.is_empty())
    }

    /// The override as a selectable record, if it serves `provider`.
    pub fn record_for(&self, provider: Provider) -> Option<CredentialRecord> {
        self.current()
            .filter(|o| o.provider == provider && !o.secret.is_empty())
            .map(|o| o.to_record())
    }

    pub fn usage(&self) -> u64 {
        self.current().map_or(0, |o| o.usage)
    }

    /// Receives the override's usage count after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.usage_tx.subscribe()
    }

    pub async fn set(&self, value: ManualOverride) -> anyhow::Result<()> {
        let usage = value.usage;
        self.replace(Some(value));
        self.usage_tx.send_replace(usage);
        self.persist().await
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        self.replace(None);
        self.usage_tx.send_replace(0);
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    /// Bump the local usage counter. Returns the new count, or `None` when no
    /// override is configured.
    pub async fn increment_usage(&self) -> anyhow::Result<Option<u64>> {
        let usage = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let Some(value) = guard.as_mut() else {
                return Ok(None);
            };
            value.usage += 1;
            value.usage
        };
        self.usage_tx.send_replace(usage);
        self.persist().await?;
        Ok(Some(usage))
    }

    fn replace(&self, value: Option<ManualOverride>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let Some(value) = self.current() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write override file {}", path.display()))
    }
}
