//! Unified error type for the engine.
//!
//! Uses `thiserror` for the error enum and provides the crate-wide
//! `EngineResult` alias. Note that a duplicate ingestion is NOT an error:
//! it is reported as `IngestOutcome::Skipped` by the engine.

use serde::Serialize;
use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Every variant is local to a single file or query; callers processing a
/// batch are expected to continue past individual failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bytes or extension could not be recognized as an embeddable medium.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// Text extraction produced nothing usable; no record is created.
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),

    /// The vector database connection could not be established at startup.
    /// Fatal precondition for all store operations, never retried per call.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// Vector database error
    #[error("vector store error: {0}")]
    Store(#[from] lancedb::Error),

    /// Arrow record batch construction or decoding error
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Embedding model load or inference error
    #[error("embedding error: {0}")]
    Embedding(String),

    /// File operation error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Input parameter is not legal
    #[error("validation error: {0}")]
    Validation(String),
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("EngineError", 2)?;

        let error_type = match self {
            EngineError::UnsupportedMedia(_) => "unsupported_media",
            EngineError::ExtractionFailed(_) => "extraction_failed",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::Store(_) => "store",
            EngineError::Arrow(_) => "arrow",
            EngineError::Embedding(_) => "embedding",
            EngineError::Io(_) => "io",
            EngineError::Validation(_) => "validation",
        };
        state.serialize_field("type", error_type)?;
        state.serialize_field("message", &self.to_string())?;

        state.end()
    }
}

/// Crate-wide Result alias
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_type_and_message() {
        let err = EngineError::UnsupportedMedia("bad header".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "unsupported_media");
        assert_eq!(json["message"], "unsupported media: bad header");
    }

    #[test]
    fn io_errors_convert() {
        fn read() -> EngineResult<Vec<u8>> {
            Ok(std::fs::read("/definitely/not/a/file")?)
        }
        assert!(matches!(read(), Err(EngineError::Io(_))));
    }
}
