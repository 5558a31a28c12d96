//! Embedding production and vector storage
//!
//! Split into submodules:
//! - `encoder`: ModalityEncoder wrapping the pretrained models
//! - `store`: LanceDB storage operations

pub mod encoder;
pub mod store;

pub use encoder::{l2_normalize, Embedder, ModalityEncoder};
pub use store::{CollectionInfo, InsertOutcome, QueryHit, VectorStore};

use serde::{Deserialize, Serialize};

// Column name constants (used by both encoder and store)
pub(crate) const COLUMN_ID: &str = "id";
pub(crate) const COLUMN_MODALITY: &str = "modality";
pub(crate) const COLUMN_SOURCE_URL: &str = "source_url";
pub(crate) const COLUMN_FILENAME: &str = "filename";
pub(crate) const COLUMN_TEXT_PREVIEW: &str = "text_preview";
pub(crate) const COLUMN_TIMESTAMP: &str = "timestamp";
pub(crate) const COLUMN_IMAGE_VECTOR: &str = "image_vector";
pub(crate) const COLUMN_TEXT_VECTOR: &str = "text_vector";
pub(crate) const COLUMN_DISTANCE: &str = "_distance";

/// Which of the two encoders produced a record's genuine vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Text,
}

impl Modality {
    pub fn label(self) -> &'static str {
        match self {
            Modality::Image => "image",
            Modality::Text => "text",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "image" => Some(Modality::Image),
            "text" => Some(Modality::Text),
            _ => None,
        }
    }
}

/// The two named vector spaces every collection schema declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSpace {
    /// Shared image/text space (512)
    Image,
    /// Text-only space (384)
    Text,
}

impl VectorSpace {
    pub(crate) fn column(self) -> &'static str {
        match self {
            VectorSpace::Image => COLUMN_IMAGE_VECTOR,
            VectorSpace::Text => COLUMN_TEXT_VECTOR,
        }
    }
}

/// One entry per ingested file within a collection.
///
/// Exactly one of `image_vector`/`text_vector` is a genuine L2-normalized
/// embedding; the other is a zero-filled placeholder of the correct
/// dimension, since the schema requires a value in every named vector
/// space regardless of modality. Records are never mutated after creation.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: String,
    pub modality: Modality,
    /// Origin identifier of the file; dedup key within a collection.
    pub source_url: String,
    /// Display name, not authoritative for type detection.
    pub filename: String,
    /// Leading excerpt of extracted text, empty for image modality.
    pub text_preview: String,
    /// Shared-space vector (512); zeros unless `modality == Image`.
    pub image_vector: Vec<f32>,
    /// Text-space vector (384); zeros unless `modality == Text`.
    pub text_vector: Vec<f32>,
    /// Ingestion time, RFC 3339.
    pub timestamp: String,
}
