//! Engine configuration

use serde::{Deserialize, Serialize};

/// Collection name used when sanitization leaves nothing usable, and as
/// the prefix guard for names that would otherwise start with a digit.
pub const DEFAULT_COLLECTION: &str = "Documents";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub lancedb_path: String,
    /// Text-only embedding model (dense text space)
    pub text_embedding_model: String,
    pub text_vector_size: u64,
    /// Text branch of the joint image/text encoder (shared space)
    pub clip_text_embedding_model: String,
    /// Image branch of the joint image/text encoder (shared space)
    pub image_embedding_model: String,
    pub image_vector_size: u64,
    /// Upper bound on the stored `text_preview` excerpt, in characters
    pub preview_max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lancedb_path: String::new(),
            text_embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            text_vector_size: 384,
            clip_text_embedding_model: "Qdrant/clip-ViT-B-32-text".to_string(),
            image_embedding_model: "Qdrant/clip-ViT-B-32-vision".to_string(),
            image_vector_size: 512,
            preview_max_chars: 512,
        }
    }
}

impl EngineConfig {
    /// Config rooted at a data directory, with the production model set.
    pub fn with_data_dir(dir: &std::path::Path) -> Self {
        Self {
            lancedb_path: dir.join("lancedb").to_string_lossy().to_string(),
            ..Self::default()
        }
    }
}
