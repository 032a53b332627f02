//! Error types for registry and ledger operations

/// Errors from key registry and usage ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already registered: {0}")]
    Duplicate(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
