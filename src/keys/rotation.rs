//! Marks spent keys exhausted and records the switch.

use crate::error::StoreError;
use crate::keys::record::{CredentialRecord, KeyStatus, NONE_AVAILABLE, RotationEvent};
use crate::keys::selector::KeySelector;
use crate::keys::store::{CredentialStore, RotationLog};
use chrono::Utc;
use std::sync::Arc;

pub struct RotationController {
    store: Arc<dyn CredentialStore>,
    log: Arc<dyn RotationLog>,
    selector: Arc<KeySelector>,
}

impl RotationController {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        log: Arc<dyn RotationLog>,
        selector: Arc<KeySelector>,
    ) -> Self {
        Self {
            store,
            log,
            selector,
        }
    }

    /// Retire `exhausted` and log which key takes over. Never fails: store
    /// errors are logged so they cannot replace the upstream error.
    ///
    /// Override and fallback keys are not store-backed and are left alone.
    pub async fn rotate(&self, exhausted: &CredentialRecord, reason: &str) {
        if !exhausted.is_store_backed() {
            tracing::error!(
                provider = %exhausted.provider,
                alias = %exhausted.alias,
                origin = ?exhausted.origin,
                "non-rotatable key exhausted or invalid"
            );
            return;
        }

        if let Err(error) = self.try_rotate(exhausted, reason).await {
            tracing::error!(
                provider = %exhausted.provider,
                alias = %exhausted.alias,
                %error,
                "key rotation failed"
            );
        }
    }

    async fn try_rotate(&self, exhausted: &CredentialRecord, reason: &str) -> Result<(), StoreError> {
        let provider = exhausted.provider;

        self.store.set_status(&exhausted.id, KeyStatus::Exhausted).await?;
        self.selector.cache().invalidate(provider).await;

        let next = self.selector.select_keys(provider).await;
        let new_alias = next
            .first()
            .map_or_else(|| NONE_AVAILABLE.to_string(), |record| record.alias.clone());

        tracing::warn!(
            %provider,
            previous = %exhausted.alias,
            next = %new_alias,
            reason,
            "rotated API key"
        );

        self.log
            .append(RotationEvent {
                timestamp: Utc::now(),
                provider,
                previous_alias: exhausted.alias.clone(),
                new_alias,
                reason: reason.to_string(),
            })
            .await
    }
}
