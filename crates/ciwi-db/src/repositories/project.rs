//! SQLite implementation of ProjectRepository.

use crate::{Database, db_err, from_json, from_ms, to_json, to_ms};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::config::PipelineSpec;
use ciwi_core::ids::{ChainDbId, PipelineDbId, ProjectId};
use ciwi_core::ports::ProjectRepository;
use ciwi_core::project::{
    PersistedChain, PersistedPipeline, Project, ProjectDetail, ProjectImport, ProjectVaultSettings,
};
use ciwi_core::vault::SecretRef;
use ciwi_core::{Error, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashSet;

const PROJECT_COLUMNS: &str = "id, name, repo_url, repo_ref, config_path, loaded_commit, vault_connection, vault_secrets, updated_ms";

const PIPELINE_SELECT: &str = "SELECT p.id, p.project_id, pr.name AS project_name, p.pipeline_id, p.position, p.spec \
     FROM pipelines p JOIN projects pr ON pr.id = p.project_id";

const CHAIN_SELECT: &str = "SELECT c.id, c.project_id, pr.name AS project_name, c.chain_id, c.pipelines \
     FROM pipeline_chains c JOIN projects pr ON pr.id = c.project_id";

/// SQLite implementation of ProjectRepository.
pub struct SqliteProjectRepository {
    db: Database,
}

impl SqliteProjectRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_project(r: &SqliteRow) -> Result<Project> {
        let secrets: Vec<SecretRef> = from_json(&r.get::<String, _>("vault_secrets"))?;
        Ok(Project {
            id: ProjectId(r.get("id")),
            name: r.get("name"),
            repo_url: r.get("repo_url"),
            repo_ref: r.get("repo_ref"),
            config_path: r.get("config_path"),
            loaded_commit: r.get("loaded_commit"),
            updated_utc: from_ms(r.get("updated_ms")),
            vault: ProjectVaultSettings {
                connection: r.get("vault_connection"),
                secrets,
            },
        })
    }

    fn row_to_pipeline(r: &SqliteRow) -> Result<PersistedPipeline> {
        let spec: PipelineSpec = from_json(&r.get::<String, _>("spec"))?;
        Ok(PersistedPipeline {
            id: PipelineDbId(r.get("id")),
            project_id: ProjectId(r.get("project_id")),
            project_name: r.get("project_name"),
            pipeline_id: r.get("pipeline_id"),
            position: r.get::<i64, _>("position") as u32,
            spec,
        })
    }

    fn row_to_chain(r: &SqliteRow) -> Result<PersistedChain> {
        Ok(PersistedChain {
            id: ChainDbId(r.get("id")),
            project_id: ProjectId(r.get("project_id")),
            project_name: r.get("project_name"),
            chain_id: r.get("chain_id"),
            pipelines: from_json(&r.get::<String, _>("pipelines"))?,
        })
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn upsert_project(&self, import: &ProjectImport) -> Result<ProjectDetail> {
        let name = import.config.project.name.trim();
        if name.is_empty() {
            return Err(Error::invalid("project name is required"));
        }
        let now = to_ms(Utc::now());

        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let project_id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE projects SET repo_url = ?, repo_ref = ?, config_path = ?, loaded_commit = ?, updated_ms = ? WHERE id = ?",
                )
                .bind(&import.repo_url)
                .bind(&import.repo_ref)
                .bind(&import.config_path)
                .bind(&import.loaded_commit)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                id
            }
            None => sqlx::query(
                "INSERT INTO projects (name, repo_url, repo_ref, config_path, loaded_commit, updated_ms) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(&import.repo_url)
            .bind(&import.repo_ref)
            .bind(&import.config_path)
            .bind(&import.loaded_commit)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .last_insert_rowid(),
        };

        // A vault block in the file replaces the stored binding; no block
        // keeps whatever an operator configured through the API.
        if let Some(vault) = import.vault_settings() {
            sqlx::query("UPDATE projects SET vault_connection = ?, vault_secrets = ? WHERE id = ?")
                .bind(&vault.connection)
                .bind(to_json(&vault.secrets)?)
                .bind(project_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let mut keep = HashSet::new();
        for (position, spec) in import.config.pipelines.iter().enumerate() {
            keep.insert(spec.id.clone());
            sqlx::query(
                r#"INSERT INTO pipelines (project_id, pipeline_id, position, spec)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT (project_id, pipeline_id)
                   DO UPDATE SET position = excluded.position, spec = excluded.spec"#,
            )
            .bind(project_id)
            .bind(&spec.id)
            .bind(position as i64)
            .bind(to_json(spec)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT pipeline_id FROM pipelines WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        for stale in stored.iter().filter(|id| !keep.contains(*id)) {
            sqlx::query("DELETE FROM pipelines WHERE project_id = ? AND pipeline_id = ?")
                .bind(project_id)
                .bind(stale)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let mut keep = HashSet::new();
        for (position, chain) in import.config.pipeline_chains.iter().enumerate() {
            keep.insert(chain.id.clone());
            sqlx::query(
                r#"INSERT INTO pipeline_chains (project_id, chain_id, position, pipelines)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT (project_id, chain_id)
                   DO UPDATE SET position = excluded.position, pipelines = excluded.pipelines"#,
            )
            .bind(project_id)
            .bind(&chain.id)
            .bind(position as i64)
            .bind(to_json(&chain.pipelines)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT chain_id FROM pipeline_chains WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        for stale in stored.iter().filter(|id| !keep.contains(*id)) {
            sqlx::query("DELETE FROM pipeline_chains WHERE project_id = ? AND chain_id = ?")
                .bind(project_id)
                .bind(stale)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        drop(guard);

        tracing::info!(
            project = %name,
            project_id,
            pipelines = import.config.pipelines.len(),
            chains = import.config.pipeline_chains.len(),
            "stored project configuration"
        );

        self.get_project_detail(ProjectId(project_id))
            .await?
            .ok_or_else(|| Error::Internal(format!("project {project_id} vanished after upsert")))
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
            .bind(id.get())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?"))
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"))
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::row_to_project).collect()
    }

    async fn get_project_detail(&self, id: ProjectId) -> Result<Option<ProjectDetail>> {
        let Some(project) = self.get_project(id).await? else {
            return Ok(None);
        };
        let pipelines = self.list_pipelines(id).await?;
        let chains = self.list_chains(id).await?;
        Ok(Some(ProjectDetail {
            project,
            pipelines,
            chains,
        }))
    }

    async fn set_project_vault(
        &self,
        id: ProjectId,
        settings: &ProjectVaultSettings,
    ) -> Result<Project> {
        let guard = self.db.write_lock().await;
        let result = sqlx::query(
            "UPDATE projects SET vault_connection = ?, vault_secrets = ?, updated_ms = ? WHERE id = ?",
        )
        .bind(settings.connection_name())
        .bind(to_json(&settings.secrets)?)
        .bind(to_ms(Utc::now()))
        .bind(id.get())
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        drop(guard);

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("project {id} not found")));
        }
        self.get_project(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {id} not found")))
    }

    async fn get_pipeline(&self, id: PipelineDbId) -> Result<Option<PersistedPipeline>> {
        let row = sqlx::query(&format!("{PIPELINE_SELECT} WHERE p.id = ?"))
            .bind(id.get())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn get_pipeline_by_name(
        &self,
        project_id: ProjectId,
        pipeline_id: &str,
    ) -> Result<Option<PersistedPipeline>> {
        let row = sqlx::query(&format!(
            "{PIPELINE_SELECT} WHERE p.project_id = ? AND p.pipeline_id = ?"
        ))
        .bind(project_id.get())
        .bind(pipeline_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn list_pipelines(&self, project_id: ProjectId) -> Result<Vec<PersistedPipeline>> {
        let rows = sqlx::query(&format!(
            "{PIPELINE_SELECT} WHERE p.project_id = ? ORDER BY p.position, p.id"
        ))
        .bind(project_id.get())
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn get_chain(&self, id: ChainDbId) -> Result<Option<PersistedChain>> {
        let row = sqlx::query(&format!("{CHAIN_SELECT} WHERE c.id = ?"))
            .bind(id.get())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_chain).transpose()
    }

    async fn list_chains(&self, project_id: ProjectId) -> Result<Vec<PersistedChain>> {
        let rows = sqlx::query(&format!(
            "{CHAIN_SELECT} WHERE c.project_id = ? ORDER BY c.position, c.id"
        ))
        .bind(project_id.get())
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_chain).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;
    use ciwi_core::config::ProjectConfig;

    fn import(yaml: &str) -> ProjectImport {
        ProjectImport {
            repo_url: "https://example.com/ciwi.git".into(),
            repo_ref: "main".into(),
            config_path: "ciwi-project.yaml".into(),
            loaded_commit: "0123456789abcdef0123456789abcdef01234567".into(),
            config: ProjectConfig::from_yaml(yaml).unwrap(),
        }
    }

    const V1: &str = r#"
project:
  name: ciwi
pipelines:
  - id: build
    jobs:
      - id: compile
        steps:
          - run: make
  - id: package
    jobs:
      - id: tar
        steps:
          - run: tar czf out.tgz dist
pipeline_chains:
  - id: release
    pipelines: [build, package]
"#;

    const V2: &str = r#"
project:
  name: ciwi
pipelines:
  - id: build
    jobs:
      - id: compile
        steps:
          - run: make all
"#;

    #[tokio::test]
    async fn test_upsert_creates_project_with_pipelines_and_chains() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteProjectRepository::new(db);

        let detail = repo.upsert_project(&import(V1)).await.unwrap();
        assert_eq!(detail.project.name, "ciwi");
        assert_eq!(detail.pipelines.len(), 2);
        assert_eq!(detail.pipelines[1].pipeline_id, "package");
        assert_eq!(detail.chains[0].pipelines, vec!["build", "package"]);

        let by_name = repo.get_project_by_name("ciwi").await.unwrap().unwrap();
        assert_eq!(by_name.id, detail.project.id);
    }

    #[tokio::test]
    async fn test_reload_keeps_pipeline_ids_and_drops_removed() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteProjectRepository::new(db);

        let first = repo.upsert_project(&import(V1)).await.unwrap();
        let second = repo.upsert_project(&import(V2)).await.unwrap();

        assert_eq!(first.project.id, second.project.id);
        assert_eq!(second.pipelines.len(), 1);
        assert_eq!(second.pipelines[0].id, first.pipelines[0].id);
        assert_eq!(
            second.pipelines[0].spec.jobs[0].steps[0].run.as_deref(),
            Some("make all")
        );
        assert!(second.chains.is_empty());
        assert!(repo.get_pipeline(first.pipelines[1].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vault_binding_survives_reload_without_vault_block() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteProjectRepository::new(db);
        let detail = repo.upsert_project(&import(V1)).await.unwrap();

        let settings = ProjectVaultSettings {
            connection: Some("home-vault".into()),
            secrets: vec![SecretRef {
                name: "gh".into(),
                mount: None,
                path: "ci/github".into(),
                key: "token".into(),
                kv_version: None,
            }],
        };
        repo.set_project_vault(detail.project.id, &settings).await.unwrap();
        repo.upsert_project(&import(V2)).await.unwrap();

        let project = repo.get_project(detail.project.id).await.unwrap().unwrap();
        assert_eq!(project.vault, settings);
    }

    #[tokio::test]
    async fn test_set_vault_on_unknown_project() {
        let (db, _dir) = temp_db().await;
        let repo = SqliteProjectRepository::new(db);
        let err = repo
            .set_project_vault(ProjectId(99), &ProjectVaultSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::NotFound);
    }
}
