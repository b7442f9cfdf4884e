use thiserror::Error;

/// Shared error type used across all Quasar crates.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Custody error: {0}")]
    Custody(String),

    /// The event source or another upstream service is unreachable.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}
