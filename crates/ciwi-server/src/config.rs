//! Server configuration from flags, environment and `.env`.

use ciwi_scheduler::SchedulerConfig;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ciwi")]
#[command(author, version, about = "ciwi CI control-plane server", long_about = None)]
pub struct ServerConfig {
    /// Listen address. `:8112` binds every interface.
    #[arg(long, env = "CIWI_SERVER_ADDR", default_value = ":8112", value_parser = parse_addr)]
    pub addr: SocketAddr,

    #[arg(long, env = "CIWI_DB_PATH", default_value = "ciwi.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "CIWI_ARTIFACTS_DIR", default_value = "ciwi-artifacts")]
    pub artifacts_dir: PathBuf,

    #[arg(long, env = "CIWI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Human)]
    pub log_format: LogFormat,

    /// Local project config files loaded at startup.
    #[arg(long = "project-config")]
    pub project_configs: Vec<PathBuf>,

    /// Repository for which a selection's source-ref override applies.
    #[arg(long, env = "CIWI_SOURCE_REF_OVERRIDE_REPO", default_value = "")]
    pub source_ref_override_repo: String,
}

impl ServerConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            source_ref_override_repo: self.source_ref_override_repo.trim().to_string(),
            ..SchedulerConfig::default()
        }
    }
}

/// Accept `host:port` or a bare `:port`.
fn parse_addr(raw: &str) -> Result<SocketAddr, String> {
    let raw = raw.trim();
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address {raw:?}: {e}"))
}
