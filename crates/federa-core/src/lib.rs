//! # federa-core
//!
//! Core primitives shared by the federa federated query engine.
//!
//! This crate provides the foundational types used across all federa components:
//!
//! - **Identifiers**: Strongly-typed IDs for queries and data sources
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `federa-core` is the **only** crate allowed to define shared primitives.
//! Orchestration logic lives in `federa-flow`.
//!
//! ## Example
//!
//! ```rust
//! use federa_core::prelude::*;
//!
//! let query_id = QueryId::generate();
//! let source = DataSourceId::new("site-north")?;
//! assert_eq!(source.as_str(), "site-north");
//! # let _ = query_id;
//! # Ok::<(), federa_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{DataSourceId, QueryId};
    pub use crate::observability::{LogFormat, init_logging};
}

pub use error::{Error, Result};
pub use id::{DataSourceId, QueryId};
pub use observability::{LogFormat, init_logging};
