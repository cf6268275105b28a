// ⚠️ Error taxonomy
// Contract violations fail loudly, untrusted input is recovered by the callers.

use thiserror::Error;

/// Errors surfaced by the store, registry and loaders.
///
/// Only `InvalidQuery` and `InvalidUsage` are programming-contract violations;
/// every other variant wraps an I/O or decoding failure that stage code is
/// expected to log and skip.
#[derive(Error, Debug)]
pub enum GeozonesError {
    /// Bad parameter combination on a store query (e.g. both `before` and `after`).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Misuse of the registry or pipeline API (duplicate level, unknown parent...).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Geometry could not be decoded or has an unsupported type.
    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Remote call failed; `transient` tells whether a retry could help.
    #[error("HTTP error: {message}")]
    Http { message: String, transient: bool },

    /// No loader is registered for a dataset file.
    #[error("no loader for {0}")]
    NoLoader(String),
}

impl GeozonesError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            GeozonesError::InvalidQuery(_) | GeozonesError::InvalidUsage(_)
        )
    }
}

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, GeozonesError>;
