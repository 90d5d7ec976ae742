use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{AlignError, DecodeError, StorageError};
use crate::summary::SummaryError;

/// Why a stage task failed.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load page: {0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Align(#[from] AlignError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Summarization failed: {0}")]
    Summary(#[from] SummaryError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to serialize stage output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Missing input: {0}")]
    MissingInput(String),
}

impl PipelineError {
    /// Whether another attempt could succeed. Bad input never gets better;
    /// alignment, storage and collaborator failures may.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Decode(DecodeError::Read { .. }) => true,
            PipelineError::Decode(_) => false,
            PipelineError::Align(_) => true,
            PipelineError::Storage(StorageError::InvalidKey { .. }) => false,
            PipelineError::Storage(_) => true,
            PipelineError::Summary(e) => e.is_retryable(),
            PipelineError::Database(_) => true,
            PipelineError::Serialize(_) => false,
            PipelineError::MissingInput(_) => false,
        }
    }
}
