//! Crate-wide error type.

use thiserror::Error;

use crate::{PageId, TransactionId};

/// Errors surfaced by the storage engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("buffer pool full: no unpinned frame available")]
    Full,

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("transaction {tx_id}: {reason}")]
    TransactionState { tx_id: TransactionId, reason: String },

    #[error("lock denied on page {0}")]
    LockDenied(PageId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
