//! SQLite implementation of AppStateRepository.

use crate::{Database, db_err, to_ms};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::Result;
use ciwi_core::ports::AppStateRepository;
use sqlx::Row;

/// SQLite implementation of AppStateRepository.
pub struct SqliteAppStateRepository {
    db: Database,
}

impl SqliteAppStateRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AppStateRepository for SqliteAppStateRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.db.write_lock().await;
        sqlx::query(
            r#"INSERT INTO app_state (key, value, updated_ms) VALUES (?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms"#,
        )
        .bind(key)
        .bind(value)
        .bind(to_ms(Utc::now()))
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.db.write_lock().await;
        sqlx::query("DELETE FROM app_state WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM app_state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| (r.get("key"), r.get("value"))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;

    #[tokio::test]
    async fn test_set_get_and_prefix_listing() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteAppStateRepository::new(db);

        repo.set("agent_snapshot:a", "{}").await.unwrap();
        repo.set("agent_snapshot:b", "{}").await.unwrap();
        repo.set("agent_update_target", "1.2.0").await.unwrap();
        repo.set("agent_update_target", "1.3.0").await.unwrap();

        assert_eq!(
            repo.get("agent_update_target").await.unwrap().as_deref(),
            Some("1.3.0")
        );
        let snapshots = repo.list_prefix("agent_snapshot:").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].0, "agent_snapshot:a");

        repo.delete("agent_snapshot:a").await.unwrap();
        assert!(repo.get("agent_snapshot:a").await.unwrap().is_none());
    }
}
