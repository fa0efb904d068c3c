//! Test infrastructure for Kiln.
//!
//! [`TestContext`] wires the scheduler and fleet services over the in-memory
//! repositories. With the `integration` feature, the database tests start a
//! PostgreSQL container through [`TestContext::postgres_only`].
//!
//! # Usage
//!
//! ```ignore
//! use kiln_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await;
//!     // Use ctx.host_manager(), ctx.finalizer(), ctx.tasks, etc.
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;

pub use context::TestContext;
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,kiln_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
