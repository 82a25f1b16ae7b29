//! ciwi server entrypoint.

use anyhow::Context;
use ciwi_api::{AppState, Collaborators, Repositories, create_router};
use ciwi_db::{
    Database, SqliteAppStateRepository, SqliteJobExecutionRepository, SqliteProjectRepository,
    SqliteVaultRepository,
};
use ciwi_git::GitSourceRepository;
use ciwi_secrets::{DEFAULT_VAULT_DEADLINE, VaultClient, VaultSecretResolver};
use clap::Parser;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod config;
mod logging;

use config::ServerConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = ServerConfig::parse();
    logging::init(config.log_format);

    let db = Database::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    tokio::fs::create_dir_all(&config.artifacts_dir)
        .await
        .with_context(|| format!("creating {}", config.artifacts_dir.display()))?;

    let vaults = Arc::new(SqliteVaultRepository::new(db.clone()));
    let vault_client = Arc::new(VaultClient::new(DEFAULT_VAULT_DEADLINE)?);
    let state = Arc::new(AppState::assemble(
        Repositories {
            jobs: Arc::new(SqliteJobExecutionRepository::new(db.clone())),
            projects: Arc::new(SqliteProjectRepository::new(db.clone())),
            vaults: vaults.clone(),
            app_state: Arc::new(SqliteAppStateRepository::new(db.clone())),
        },
        Collaborators {
            source: Arc::new(GitSourceRepository::default()),
            secrets: Arc::new(VaultSecretResolver::new(vaults, vault_client.clone())),
            vault_client,
        },
        config.scheduler(),
        config.artifacts_dir.clone(),
    ));

    let restored = state.agents.restore().await?;
    info!(agents = restored, "restored agent snapshots");

    for path in &config.project_configs {
        if let Err(e) = state.projects.load_local(path).await {
            warn!(path = %path.display(), error = %e, "failed to load project config");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = state.maintenance.clone();
    let maintenance_task = tokio::spawn(async move { maintenance.run(shutdown_rx).await });

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!(addr = %config.addr, db = %config.db_path.display(), "ciwi server listening");

    let signal_tx = shutdown_tx.clone();
    let server = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .into_future();
    let mut drain_rx = shutdown_tx.subscribe();
    let drain_deadline = async move {
        if drain_rx.wait_for(|stop| *stop).await.is_ok() {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        result = server => result?,
        _ = drain_deadline => warn!("open connections did not drain in time"),
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, maintenance_task).await.is_err() {
        warn!("maintenance loop did not stop in time");
    }
    db.close().await;
    info!("ciwi server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
