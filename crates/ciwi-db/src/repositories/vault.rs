//! SQLite implementation of VaultRepository.

use crate::{Database, db_err, from_ms, to_ms};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciwi_core::ids::VaultConnectionId;
use ciwi_core::ports::VaultRepository;
use ciwi_core::vault::{AuthMethod, UpsertVaultConnection, VaultConnection};
use ciwi_core::{Error, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

const COLUMNS: &str = "id, name, url, auth_method, approle_mount, role_id, secret_id_env, namespace, kv_default_mount, kv_default_version, updated_ms";

/// SQLite implementation of VaultRepository.
pub struct SqliteVaultRepository {
    db: Database,
}

impl SqliteVaultRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_connection(r: &SqliteRow) -> Result<VaultConnection> {
        let method: String = r.get("auth_method");
        let auth_method = AuthMethod::parse(&method)
            .ok_or_else(|| Error::Database(format!("unknown vault auth method {method:?}")))?;
        Ok(VaultConnection {
            id: VaultConnectionId(r.get("id")),
            name: r.get("name"),
            url: r.get("url"),
            auth_method,
            approle_mount: r.get("approle_mount"),
            role_id: r.get("role_id"),
            secret_id_env: r.get("secret_id_env"),
            namespace: r.get("namespace"),
            kv_default_mount: r.get("kv_default_mount"),
            kv_default_version: r.get::<i64, _>("kv_default_version") as u8,
            updated_utc: from_ms(r.get("updated_ms")),
        })
    }
}

#[async_trait]
impl VaultRepository for SqliteVaultRepository {
    async fn list(&self) -> Result<Vec<VaultConnection>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM vault_connections ORDER BY name"))
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::row_to_connection).collect()
    }

    async fn get(&self, id: VaultConnectionId) -> Result<Option<VaultConnection>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM vault_connections WHERE id = ?"))
            .bind(id.get())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_connection).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<VaultConnection>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM vault_connections WHERE name = ?"))
            .bind(name.trim())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_connection).transpose()
    }

    async fn upsert(
        &self,
        connection: &UpsertVaultConnection,
        now: DateTime<Utc>,
    ) -> Result<VaultConnection> {
        connection.validate()?;
        let guard = self.db.write_lock().await;
        sqlx::query(
            r#"INSERT INTO vault_connections
               (name, url, auth_method, approle_mount, role_id, secret_id_env, namespace,
                kv_default_mount, kv_default_version, updated_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (name) DO UPDATE SET
                 url = excluded.url,
                 auth_method = excluded.auth_method,
                 approle_mount = excluded.approle_mount,
                 role_id = excluded.role_id,
                 secret_id_env = excluded.secret_id_env,
                 namespace = excluded.namespace,
                 kv_default_mount = excluded.kv_default_mount,
                 kv_default_version = excluded.kv_default_version,
                 updated_ms = excluded.updated_ms"#,
        )
        .bind(connection.name.trim())
        .bind(connection.url.trim_end_matches('/'))
        .bind(connection.auth_method.as_str())
        .bind(connection.approle_mount.trim_matches('/'))
        .bind(&connection.role_id)
        .bind(&connection.secret_id_env)
        .bind(connection.namespace.as_deref().filter(|n| !n.trim().is_empty()))
        .bind(connection.kv_default_mount.trim_matches('/'))
        .bind(i64::from(connection.kv_default_version))
        .bind(to_ms(now))
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        drop(guard);

        tracing::info!(vault_connection = %connection.name, "stored vault connection");
        self.get_by_name(&connection.name).await?.ok_or_else(|| {
            Error::Internal(format!("vault connection {} vanished after upsert", connection.name))
        })
    }

    async fn delete(&self, id: VaultConnectionId) -> Result<()> {
        let _guard = self.db.write_lock().await;
        let result = sqlx::query("DELETE FROM vault_connections WHERE id = ?")
            .bind(id.get())
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("vault connection {id} not found")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;

    fn upsert(url: &str) -> UpsertVaultConnection {
        UpsertVaultConnection {
            name: "home-vault".into(),
            url: url.into(),
            auth_method: AuthMethod::Approle,
            approle_mount: "approle".into(),
            role_id: "role-1".into(),
            secret_id_env: "CIWI_VAULT_SECRET_ID".into(),
            namespace: None,
            kv_default_mount: "secret".into(),
            kv_default_version: 2,
        }
    }

    #[tokio::test]
    async fn test_upsert_by_name_keeps_id() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteVaultRepository::new(db);
        let now = Utc::now();

        let first = repo.upsert(&upsert("https://vault.local:8200/"), now).await.unwrap();
        assert_eq!(first.url, "https://vault.local:8200");
        let second = repo.upsert(&upsert("https://vault2.local:8200"), now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(repo.list().await.unwrap().len(), 1);
        assert_eq!(
            repo.get(first.id).await.unwrap().unwrap().url,
            "https://vault2.local:8200"
        );
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteVaultRepository::new(db);
        let err = repo.delete(VaultConnectionId(7)).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::NotFound);
    }
}
