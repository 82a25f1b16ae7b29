//! Repository implementations for SQLite.

mod app_state;
mod job_execution;
mod project;
mod vault;

pub use app_state::SqliteAppStateRepository;
pub use job_execution::SqliteJobExecutionRepository;
pub use project::SqliteProjectRepository;
pub use vault::SqliteVaultRepository;
