//! Error type shared by the federa crates.
//!
//! Domain crates wrap this in their own error enums; only failures that can
//! originate in `federa-core` itself live here.

/// The result type used throughout federa-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing identifiers and settings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A query or data source identifier was rejected.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Why the identifier was rejected.
        message: String,
    },

    /// A setting or argument could not be parsed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A broken internal invariant.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl Error {
    /// Creates an [`Error::InvalidInput`].
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates an [`Error::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
