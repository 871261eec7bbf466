//! Key-value settings store backed by the `settings` table.
//!
//! The admin UI writes rows here; the config loader reads a full snapshot
//! at startup and on each scheduler tick, so settings changes apply
//! without a restart.

use std::collections::HashMap;

use sqlx::SqlitePool;

use super::StoreError;

/// Read/write access to the settings table.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read a single setting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Insert or update a setting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Snapshot every setting into a map for the config loader.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn load_all(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db;

    #[tokio::test]
    async fn test_set_get_and_snapshot() {
        let pool = db::connect_memory().await.expect("db");
        let store = SettingsStore::new(pool);

        assert!(store.get("llm_provider").await.expect("get").is_none());

        store.set("llm_provider", "anthropic").await.expect("set");
        store.set("llm_rate_limit_rpm", "30").await.expect("set");
        store.set("llm_provider", "gemini").await.expect("upsert");

        assert_eq!(
            store.get("llm_provider").await.expect("get").as_deref(),
            Some("gemini")
        );

        let all = store.load_all().await.expect("snapshot");
        assert_eq!(all.len(), 2);
        assert_eq!(all["llm_rate_limit_rpm"], "30");
    }
}
