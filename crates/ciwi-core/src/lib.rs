//! ciwi Core
//!
//! Core domain types, traits, and error handling for the ciwi server.
//! This crate performs no I/O and defines the shared vocabulary used
//! by the store, the scheduler, and the HTTP surface.

pub mod agent;
pub mod artifact;
pub mod capability;
pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod metadata;
pub mod ports;
pub mod project;
pub mod source;
pub mod vault;

pub use error::{Error, ErrorKind, Result};
pub use ids::*;
