//! Shared test utilities for federa integration tests.
//!
//! This crate provides:
//! - [`TestContext`]: A store, a recording dispatcher and a fixed clock
//! - [`QueryTreeFactory`] / [`ChildOutcome`]: Query trees in chosen states
//! - [`FaultyDispatcher`] / [`FaultyStore`]: Per-query failure injection
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use federa_test_utils::{ChildOutcome, QueryTreeFactory, TestContext};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let tree = QueryTreeFactory::new(&ctx)
//!         .child("site-a", ChildOutcome::Completed(120))
//!         .build()
//!         .await;
//!     let report = ctx.sealer().run_once(ctx.after_deadline()).await;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod faults;
pub mod fixtures;

pub use assertions::*;
pub use faults::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("federa_flow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
