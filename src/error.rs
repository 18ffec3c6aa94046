//! Error types for the fingerprint engine.

use thiserror::Error;
use uuid::Uuid;

use crate::index::models::SourceStatus;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    BlobStore(String),

    #[error("source {0} not found")]
    SourceNotFound(Uuid),

    #[error("source {source_id}: illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        source_id: Uuid,
        from: SourceStatus,
        to: SourceStatus,
    },

    #[error("source {0}: matched status requires an original_ref")]
    MissingOriginalRef(Uuid),

    #[error("malformed hash token: {0:?}")]
    MalformedHash(String),

    #[error("pipeline stage {stage} failed for source {source_id}: {message}")]
    Pipeline {
        source_id: Uuid,
        stage: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Worth retrying with backoff before giving up on the source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Database(_) | EngineError::BlobStore(_))
    }

    /// On exhaustion the source is left `pending` for later recovery instead
    /// of being flagged. Only index transients qualify; a flag written over a
    /// transient failure would corrupt the status.
    pub fn leaves_pending(&self) -> bool {
        matches!(self, EngineError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
