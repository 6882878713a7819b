//! SQLite-backed credential store and rotation log.

use crate::error::StoreError;
use crate::keys::record::{
    CredentialOrigin, CredentialRecord, KeyStatus, NewCredential, Provider, RotationEvent, Secret,
};
use crate::keys::store::{CredentialStore, RotationLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use std::str::FromStr;

const KEY_COLUMNS: &str = "id, provider, secret, alias, status, usage_count, usage_limit, \
                           last_used, added_by, created_at";

#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    /// Open (or create) the database at `url` and apply pending migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn get_key(&self, id: &str) -> Result<CredentialRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record_from_row(&row)
    }
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: "api_keys",
        message: message.into(),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<CredentialRecord, StoreError> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let usage_count: i64 = row.try_get("usage_count")?;
    let usage_limit: i64 = row.try_get("usage_limit")?;

    Ok(CredentialRecord {
        id: row.try_get("id")?,
        provider: provider.parse().map_err(corrupt)?,
        secret: Secret::new(row.try_get::<String, _>("secret")?),
        alias: row.try_get("alias")?,
        status: status.parse().map_err(corrupt)?,
        usage_count: u64::try_from(usage_count).map_err(|_| corrupt("negative usage_count"))?,
        usage_limit: u64::try_from(usage_limit).map_err(|_| corrupt("negative usage_limit"))?,
        last_used: row.try_get("last_used")?,
        added_by: row.try_get("added_by")?,
        created_at: row.try_get("created_at")?,
        origin: CredentialOrigin::Store,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<RotationEvent, StoreError> {
    let provider: String = row.try_get("provider")?;
    Ok(RotationEvent {
        timestamp: row.try_get("timestamp")?,
        provider: provider.parse().map_err(|message: String| StoreError::Corrupt {
            table: "key_rotation_logs",
            message,
        })?,
        previous_alias: row.try_get("previous_alias")?,
        new_alias: row.try_get("new_alias")?,
        reason: row.try_get("reason")?,
    })
}

fn check_affected(rows: u64, id: &str) -> Result<(), StoreError> {
    if rows == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn query_active(&self, provider: Provider) -> Result<Vec<CredentialRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys \
             WHERE provider = ? AND status = 'active' \
             ORDER BY usage_count ASC"
        ))
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn set_status(&self, id: &str, status: KeyStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE api_keys SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        check_affected(result.rows_affected(), id)
    }

    async fn increment_usage(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE api_keys SET usage_count = usage_count + 1, last_used = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        check_affected(result.rows_affected(), id)
    }

    async fn add_key(&self, key: NewCredential) -> Result<CredentialRecord, StoreError> {
        let usage_limit = i64::try_from(key.usage_limit).unwrap_or(i64::MAX);
        let record = key.into_record(uuid::Uuid::new_v4().to_string(), Utc::now());

        sqlx::query(
            "INSERT INTO api_keys \
             (id, provider, secret, alias, status, usage_count, usage_limit, last_used, added_by, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, NULL, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.provider.as_str())
        .bind(record.secret.expose())
        .bind(&record.alias)
        .bind(record.status.as_str())
        .bind(usage_limit)
        .bind(&record.added_by)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            provider = %record.provider,
            alias = %record.alias,
            added_by = %record.added_by,
            "added API key"
        );
        Ok(record)
    }

    async fn list_keys(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC, rowid DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn delete_key(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        check_affected(result.rows_affected(), id)?;
        tracing::info!(id, "deleted API key");
        Ok(())
    }
}

#[async_trait]
impl RotationLog for SqliteCredentialStore {
    async fn append(&self, event: RotationEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO key_rotation_logs (id, timestamp, provider, previous_alias, new_alias, reason) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(event.timestamp)
        .bind(event.provider.as_str())
        .bind(&event.previous_alias)
        .bind(&event.new_alias)
        .bind(&event.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RotationEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT timestamp, provider, previous_alias, new_alias, reason \
             FROM key_rotation_logs ORDER BY timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteCredentialStore {
        SqliteCredentialStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn add_and_query_round_trip() {
        let store = memory_store().await;
        let added = store
            .add_key(
                NewCredential::new(Provider::Google, Secret::new("AIza-one"))
                    .alias("Primary")
                    .usage_limit(10)
                    .added_by("ops@example.com"),
            )
            .await
            .unwrap();

        let active = store.query_active(Provider::Google).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, added.id);
        assert_eq!(active[0].secret.expose(), "AIza-one");
        assert_eq!(active[0].usage_limit, 10);
        assert_eq!(active[0].status, KeyStatus::Active);
        assert!(active[0].last_used.is_none());

        assert!(store.query_active(Provider::OpenAi).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usage_increment_reorders_selection() {
        let store = memory_store().await;
        let first = store
            .add_key(NewCredential::new(Provider::Google, Secret::new("a")).alias("first"))
            .await
            .unwrap();
        store
            .add_key(NewCredential::new(Provider::Google, Secret::new("b")).alias("second"))
            .await
            .unwrap();

        store.increment_usage(&first.id, Utc::now()).await.unwrap();
        store.increment_usage(&first.id, Utc::now()).await.unwrap();

        let active = store.query_active(Provider::Google).await.unwrap();
        assert_eq!(active[0].alias, "second");
        assert_eq!(active[1].usage_count, 2);
        assert!(active[1].last_used.is_some());
    }

    #[tokio::test]
    async fn exhausted_keys_leave_the_active_set() {
        let store = memory_store().await;
        let key = store
            .add_key(NewCredential::new(Provider::Claude, Secret::new("sk-ant")))
            .await
            .unwrap();

        store.set_status(&key.id, KeyStatus::Exhausted).await.unwrap();
        assert!(store.query_active(Provider::Claude).await.unwrap().is_empty());
        assert_eq!(store.get_key(&key.id).await.unwrap().status, KeyStatus::Exhausted);

        store.set_status(&key.id, KeyStatus::Active).await.unwrap();
        assert_eq!(store.query_active(Provider::Claude).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_and_missing_ids() {
        let store = memory_store().await;
        let key = store
            .add_key(NewCredential::new(Provider::DeepSeek, Secret::new("ds")))
            .await
            .unwrap();

        store.delete_key(&key.id).await.unwrap();
        assert!(store.list_keys().await.unwrap().is_empty());
        assert!(matches!(store.delete_key(&key.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.set_status(&key.id, KeyStatus::Active).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rotation_log_returns_newest_first() {
        let store = memory_store().await;
        for n in 0..4 {
            store
                .append(RotationEvent {
                    timestamp: Utc::now() + chrono::Duration::seconds(n),
                    provider: Provider::Google,
                    previous_alias: format!("key-{n}"),
                    new_alias: format!("key-{}", n + 1),
                    reason: "Quota Exceeded".into(),
                })
                .await
                .unwrap();
        }

        let recent = store.recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].previous_alias, "key-3");
        assert_eq!(recent[2].previous_alias, "key-1");
    }
}
