use thiserror::Error;

use crate::run::RunStatus;

/// Errors from durable store operations (used by the store port in keel-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}
