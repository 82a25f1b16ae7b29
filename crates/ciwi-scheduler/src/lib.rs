//! Pipeline expansion, leasing and job coordination for the ciwi CI server.

pub mod adhoc;
pub mod agents;
pub mod autobump;
pub mod chain;
pub mod config;
pub mod dag;
pub mod dependency;
pub mod enqueue;
pub mod expand;
pub mod lease;
pub mod lifecycle;
pub mod maintenance;
pub mod matrix;
pub mod project;
pub mod requirements;
pub mod run_id;
pub mod runtime;
pub mod validate;

pub use agents::{ActionResponse, AgentCoordinator};
pub use config::SchedulerConfig;
pub use enqueue::{EnqueueResponse, EnqueueService, VersionPreview};
pub use expand::{ExecutionMode, PipelineExpander, Selection};
pub use lease::{LeaseResponse, LeaseService};
pub use lifecycle::{JobListQuery, JobListing, JobService};
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use project::ProjectService;
pub use run_id::RunIdGenerator;
pub use runtime::DependencyRuntime;
