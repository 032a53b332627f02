//! Error types for broker operations
//!
//! Capacity conditions (exhausted, no candidates, oversized request) are
//! not errors; they are `Acquisition` variants every caller must handle.
//! Only genuine defects surface here.

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown config id: {0}")]
    UnknownConfig(String),

    #[error("store error: {0}")]
    Store(#[from] gemini_keys::Error),

    #[error("configuration error: {0}")]
    Config(#[from] common::Error),
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, Error>;
