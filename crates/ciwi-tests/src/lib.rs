//! Integration test infrastructure for the ciwi server.
//!
//! Every context runs against a fresh SQLite store in a temporary
//! directory, with a scripted source repository in place of git.
//!
//! ```ignore
//! use ciwi_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     let detail = ctx.load_project(ciwi_tests::fixtures::LINEAR_CHAIN).await.unwrap();
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,ciwi_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
