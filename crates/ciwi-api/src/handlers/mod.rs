//! Request handlers organized by resource.

pub mod agents;
pub mod chains;
pub mod health;
pub mod jobs;
pub mod pipelines;
pub mod projects;
pub mod vault;
