use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("Storage error: {0}")]
    Store(#[from] common::CommonError),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Storage operation did not finish within {0:?}")]
    StorageTimeout(Duration),

    #[error("Background task failed: {0}")]
    Task(String),
}
