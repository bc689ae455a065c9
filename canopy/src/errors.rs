//! Error types shared by the spatial and metric index engines.

use std::io;
use thiserror::Error;

use crate::storage::PageId;

/// Errors that can occur while building, mutating or querying an index.
///
/// Storage failures are propagated unchanged. Configuration and integrity
/// errors are fatal: the engine does not retry or repair on its own.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Page {page_id} is corrupted: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    #[error("Page {0} does not exist")]
    PageNotFound(PageId),

    #[error("Node on page {page_id} needs {size} bytes, page size is {max}")]
    PageTooLarge {
        page_id: PageId,
        size: usize,
        max: usize,
    },

    #[error("Page id exceeds the addressable range")]
    PageIdOverflow,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Index is closed")]
    Closed,
}

impl From<bincode::error::EncodeError> for IndexError {
    fn from(err: bincode::error::EncodeError) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for IndexError {
    fn from(err: bincode::error::DecodeError) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;
