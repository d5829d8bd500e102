use std::time::Duration;

/// Failure talking to the relational store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}
