//! Error types shared across the Gantry crates.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors produced by the core types and host-option parsing.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A string did not name a known node mode.
    #[error("unknown node mode {value:?}, expected \"Write\" or \"Read\"")]
    UnknownMode {
        /// The offending input.
        value: String,
    },

    /// A string did not name a known operation kind.
    #[error("unknown operation kind {value:?}")]
    UnknownOpKind {
        /// The offending input.
        value: String,
    },

    /// A host environment variable could not be parsed.
    #[error("invalid value for {name}: {cause}")]
    InvalidOption {
        /// The environment variable name.
        name: &'static str,
        /// Why the value was rejected.
        cause: String,
    },
}
