//! ModalityEncoder - embedding production for both modalities

use std::io::Write;

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, TextEmbedding,
    TextInitOptions,
};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Scale a vector to unit L2 norm in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Embedding production seam between the engine and the loaded models.
///
/// All four operations are pure functions of their input plus immutable
/// model state and must be safe to call concurrently.
#[allow(async_fn_in_trait)]
pub trait Embedder {
    /// Embed image bytes into the shared space, L2-normalized.
    async fn encode_image(&self, bytes: &[u8]) -> EngineResult<Vec<f32>>;

    /// Embed text into the text-only space. The raw model output is
    /// returned; normalization, where required, is the caller's
    /// responsibility (the ingestion path normalizes before storing).
    async fn encode_text(&self, text: &str) -> EngineResult<Vec<f32>>;

    /// Embed a textual query through the joint encoder's text branch so it
    /// can be compared against image vectors in the shared space.
    /// L2-normalized.
    async fn encode_query_for_image_space(&self, text: &str) -> EngineResult<Vec<f32>>;

    /// Embed a textual query for the text-only space.
    async fn encode_query_for_text_space(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Wraps the two pretrained encoders: a joint image/text encoder whose
/// branches produce comparable 512-dim vectors in a shared space, and a
/// 384-dim text-only encoder.
///
/// Model state is read-only after load; each model sits behind a `Mutex`
/// so at most one inference per model is in flight at a time. Concurrent
/// callers queue rather than fail.
pub struct ModalityEncoder {
    text: Mutex<TextEmbedding>,
    clip_text: Mutex<TextEmbedding>,
    image: Mutex<ImageEmbedding>,
    image_dim: usize,
    text_dim: usize,
}

impl ModalityEncoder {
    /// Load all three models. Weights must already be available locally
    /// or downloadable by fastembed; caching is handled upstream.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let text_model: EmbeddingModel = config
            .text_embedding_model
            .parse::<EmbeddingModel>()
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let clip_text_model: EmbeddingModel = config
            .clip_text_embedding_model
            .parse::<EmbeddingModel>()
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let image_model: ImageEmbeddingModel = config
            .image_embedding_model
            .parse::<ImageEmbeddingModel>()
            .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let text = TextEmbedding::try_new(TextInitOptions::new(text_model))
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let clip_text = TextEmbedding::try_new(TextInitOptions::new(clip_text_model))
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        let image = ImageEmbedding::try_new(ImageInitOptions::new(image_model))
            .map_err(|e| EngineError::Embedding(e.to_string()))?;

        Ok(Self {
            text: Mutex::new(text),
            clip_text: Mutex::new(clip_text),
            image: Mutex::new(image),
            image_dim: config.image_vector_size as usize,
            text_dim: config.text_vector_size as usize,
        })
    }

    fn check_dim(&self, vector: &[f32], expected: usize) -> EngineResult<()> {
        if vector.len() != expected {
            return Err(EngineError::Embedding(format!(
                "embedding dimension mismatch: got {}, expected {}",
                vector.len(),
                expected
            )));
        }
        Ok(())
    }
}

impl Embedder for ModalityEncoder {
    /// `UnsupportedMedia` when the bytes cannot be decoded as an image.
    /// The bytes are staged through a temp file because the image model
    /// consumes paths.
    async fn encode_image(&self, bytes: &[u8]) -> EngineResult<Vec<f32>> {
        let format = image::guess_format(bytes)
            .map_err(|e| EngineError::UnsupportedMedia(e.to_string()))?;
        image::load_from_memory(bytes)
            .map_err(|e| EngineError::UnsupportedMedia(e.to_string()))?;

        let suffix = format
            .extensions_str()
            .first()
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new().suffix(&suffix).tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;

        let image_path = file.path().to_string_lossy().to_string();
        let vectors = {
            let mut model = self.image.lock().await;
            model.embed(vec![image_path], None)
        }
        .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let mut vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Embedding("image embedding returned no vectors".into()))?;
        self.check_dim(&vector, self.image_dim)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    async fn encode_text(&self, text: &str) -> EngineResult<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation("text to embed is empty".into()));
        }

        let vectors = {
            let mut model = self.text.lock().await;
            model.embed(vec![text], None)
        }
        .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Embedding("text embedding returned no vectors".into()))?;
        self.check_dim(&vector, self.text_dim)?;
        Ok(vector)
    }

    async fn encode_query_for_image_space(&self, text: &str) -> EngineResult<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation("query text is empty".into()));
        }

        let vectors = {
            let mut model = self.clip_text.lock().await;
            model.embed(vec![text], None)
        }
        .map_err(|e| EngineError::Embedding(e.to_string()))?;

        let mut vector = vectors.into_iter().next().ok_or_else(|| {
            EngineError::Embedding("joint text embedding returned no vectors".into())
        })?;
        self.check_dim(&vector, self.image_dim)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    async fn encode_query_for_text_space(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.encode_text(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
