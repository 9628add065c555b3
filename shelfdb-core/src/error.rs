// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Document not found")]
    DocumentNotFound,

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Auto-increment ids exhausted after {0}")]
    IdSpaceExhausted(u64),
}

/// Coarse classification of [`ShelfError`] for callers that only care
/// about what went wrong, not where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidSpec,
    TypeMismatch,
}

impl ShelfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShelfError::CollectionNotFound(_)
            | ShelfError::IndexNotFound(_)
            | ShelfError::DocumentNotFound => ErrorKind::NotFound,
            ShelfError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            ShelfError::Serialization(_)
            | ShelfError::CollectionExists(_)
            | ShelfError::DuplicateKey(_)
            | ShelfError::InvalidQuery(_)
            | ShelfError::AggregationError(_)
            | ShelfError::IdSpaceExhausted(_) => ErrorKind::InvalidSpec,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShelfError>;
