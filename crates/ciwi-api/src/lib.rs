//! HTTP API of the ciwi CI server.
//!
//! Besides the router, the crate exposes the error mapping used by the
//! handlers: [`ApiError`] carries the HTTP status of a domain error and
//! [`grpc_code`] gives the status code an equivalent gRPC surface returns.

pub mod artifacts;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult, GrpcCode, grpc_code};
pub use routes::create_router;
pub use state::{AppState, Collaborators, Repositories};
