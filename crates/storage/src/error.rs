use quasar_core::AppError;
use thiserror::Error;

use crate::models::AccountRowError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backing store refused the operation (connection loss, fault injection).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<AccountRowError> for StoreError {
    fn from(err: AccountRowError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Database(err.to_string())
    }
}
