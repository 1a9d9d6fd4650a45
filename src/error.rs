//! Error taxonomy for the indexing and answering pipeline.
//!
//! Every failure a caller can act on gets its own variant; the HTTP layer
//! maps variants to stable wire codes via [`QaError::code`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QaError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// Asked a question before any index was built or attached.
    #[error("no index bound to this session")]
    NoIndexBound,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An answer is already in flight for this session.
    #[error("session is busy answering another question")]
    SessionBusy,

    #[error("turn not found: seq {0}")]
    TurnNotFound(i64),

    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl QaError {
    /// Stable machine-readable code carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QaError::UnsupportedFormat(_) => "unsupported_format",
            QaError::ExtractionFailed(_) => "extraction_failed",
            QaError::EmbeddingFailed(_) | QaError::StorageFailed(_) => "index_build_failed",
            QaError::NoIndexBound => "no_index_bound",
            QaError::SessionNotFound(_) | QaError::TurnNotFound(_) => "not_found",
            QaError::SessionBusy => "session_busy",
            QaError::GenerationFailed(_) => "generation_failed",
        }
    }
}
