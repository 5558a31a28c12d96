//! IndexEngine - top-level ingestion and search orchestration

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::embedding::{
    l2_normalize, Embedder, EmbeddingRecord, InsertOutcome, Modality, ModalityEncoder, QueryHit,
    VectorSpace, VectorStore,
};
use crate::embedding::store::CollectionInfo;
use crate::error::{EngineError, EngineResult};
use crate::namespace;
use crate::parser;

/// One ranked search hit as returned to the service layer.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Cosine similarity in [-1, 1]: `1 - distance` over unit vectors.
    pub score: f32,
    pub modality: Modality,
    pub filename: String,
    pub source_url: String,
    /// Leading excerpt of extracted text, empty for image hits.
    pub excerpt: String,
}

/// One file handed to [`IndexEngine::ingest_batch`].
#[derive(Debug, Clone)]
pub struct IngestFile {
    pub source_url: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub extension: String,
}

/// Per-item outcome of a batch ingestion. A failed item never aborts the
/// rest of the batch.
#[derive(Debug)]
pub struct IngestReport {
    pub source_url: String,
    pub outcome: EngineResult<InsertOutcome>,
}

/// Top-level entry point: embeds files and queries, owns the store and
/// the encoder. Stateless per request apart from the shared read-only
/// model state and the store connection.
pub struct IndexEngine<E = ModalityEncoder> {
    encoder: Arc<E>,
    store: VectorStore,
    config: EngineConfig,
}

impl IndexEngine {
    /// Connect the store and load the models. The store connection is a
    /// fatal precondition; a failure here is `StoreUnavailable`.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let store = VectorStore::connect(&config).await?;
        let encoder = Arc::new(ModalityEncoder::new(&config)?);
        Ok(Self::with_parts(encoder, store, config))
    }
}

impl<E: Embedder> IndexEngine<E> {
    /// Assemble from pre-built collaborators; the store and encoder are
    /// injected rather than owned globals.
    pub fn with_parts(encoder: Arc<E>, store: VectorStore, config: EngineConfig) -> Self {
        Self {
            encoder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Embed one file and store it in the named collection.
    ///
    /// The collection name is canonicalized first and the collection is
    /// created lazily. A `source_url` already present in the collection
    /// short-circuits to `Skipped` without re-embedding.
    pub async fn ingest(
        &self,
        collection_raw_name: &str,
        source_url: &str,
        filename: &str,
        bytes: &[u8],
        extension: &str,
    ) -> EngineResult<InsertOutcome> {
        if source_url.trim().is_empty() {
            return Err(EngineError::Validation("source_url is empty".into()));
        }

        let collection = namespace::resolve(collection_raw_name);
        self.store.ensure_collection(&collection).await?;

        if self.store.exists(&collection, source_url).await? {
            return Ok(InsertOutcome::Skipped);
        }

        let record = if parser::is_image_extension(extension) {
            self.build_image_record(source_url, filename, bytes).await?
        } else {
            self.build_text_record(source_url, filename, bytes, extension)
                .await?
        };

        self.store.insert(&collection, &record).await
    }

    /// Ingest a batch of independent files, continuing past individual
    /// failures and reporting them per item.
    pub async fn ingest_batch(
        &self,
        collection_raw_name: &str,
        files: Vec<IngestFile>,
    ) -> Vec<IngestReport> {
        let mut reports = Vec::with_capacity(files.len());
        for file in files {
            let outcome = self
                .ingest(
                    collection_raw_name,
                    &file.source_url,
                    &file.filename,
                    &file.bytes,
                    &file.extension,
                )
                .await;
            if let Err(err) = &outcome {
                tracing::warn!(
                    source_url = %file.source_url,
                    error = %err,
                    "Ingestion failed for batch item"
                );
            }
            reports.push(IngestReport {
                source_url: file.source_url,
                outcome,
            });
        }
        reports
    }

    /// Cross-modal nearest-neighbor search.
    ///
    /// The query is embedded once per space, fanned out to both named
    /// vector spaces with their mandatory modality filters, merged,
    /// deduplicated by `source_url`, and ranked by descending score.
    /// A missing or empty collection yields an empty result.
    pub async fn search(
        &self,
        collection_raw_name: &str,
        query_text: &str,
        k: usize,
    ) -> EngineResult<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let collection = namespace::resolve(collection_raw_name);

        let query_image_vec = self.encoder.encode_query_for_image_space(query_text).await?;
        let query_text_vec = self.encoder.encode_query_for_text_space(query_text).await?;

        let image_hits = self
            .store
            .query_nearest(
                &collection,
                VectorSpace::Image,
                query_image_vec,
                k,
                Modality::Image,
            )
            .await?;
        let text_hits = self
            .store
            .query_nearest(
                &collection,
                VectorSpace::Text,
                query_text_vec,
                k,
                Modality::Text,
            )
            .await?;

        tracing::debug!(
            collection = %collection,
            image_hits = image_hits.len(),
            text_hits = text_hits.len(),
            "Search fan-out complete"
        );
        Ok(merge_hits(image_hits, text_hits, k))
    }

    /// Remove a collection and all of its records. Irreversible.
    pub async fn delete_collection(&self, collection_raw_name: &str) -> EngineResult<()> {
        let collection = namespace::resolve(collection_raw_name);
        self.store.delete_collection(&collection).await
    }

    pub async fn list_collections(&self) -> EngineResult<Vec<String>> {
        self.store.list_collections().await
    }

    pub async fn collection_info(&self, collection_raw_name: &str) -> EngineResult<CollectionInfo> {
        let collection = namespace::resolve(collection_raw_name);
        self.store.collection_info(&collection).await
    }

    async fn build_image_record(
        &self,
        source_url: &str,
        filename: &str,
        bytes: &[u8],
    ) -> EngineResult<EmbeddingRecord> {
        let image_vector = self.encoder.encode_image(bytes).await?;
        Ok(EmbeddingRecord {
            id: Uuid::new_v4().to_string(),
            modality: Modality::Image,
            source_url: source_url.to_string(),
            filename: filename.to_string(),
            text_preview: String::new(),
            image_vector,
            text_vector: vec![0.0; self.config.text_vector_size as usize],
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    async fn build_text_record(
        &self,
        source_url: &str,
        filename: &str,
        bytes: &[u8],
        extension: &str,
    ) -> EngineResult<EmbeddingRecord> {
        let text = parser::extract_text(bytes, extension)?;
        let mut text_vector = self.encoder.encode_text(&text).await?;
        l2_normalize(&mut text_vector);

        Ok(EmbeddingRecord {
            id: Uuid::new_v4().to_string(),
            modality: Modality::Text,
            source_url: source_url.to_string(),
            filename: filename.to_string(),
            text_preview: parser::build_preview(&text, self.config.preview_max_chars),
            image_vector: vec![0.0; self.config.image_vector_size as usize],
            text_vector,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Merge the two per-space hit lists into one ranked result list.
///
/// Score is `1 - distance` (cosine similarity over unit vectors). The two
/// lists are modality-disjoint by construction, but dedup by `source_url`
/// is applied anyway, first occurrence winning. Sorted descending by
/// score, truncated to `k`.
pub(crate) fn merge_hits(
    image_hits: Vec<QueryHit>,
    text_hits: Vec<QueryHit>,
    k: usize,
) -> Vec<SearchResult> {
    let mut seen = std::collections::HashSet::new();
    let mut results: Vec<SearchResult> = Vec::with_capacity(image_hits.len() + text_hits.len());

    for hit in image_hits.into_iter().chain(text_hits) {
        if !seen.insert(hit.source_url.clone()) {
            continue;
        }
        results.push(SearchResult {
            score: 1.0 - hit.distance,
            modality: hit.modality,
            filename: hit.filename,
            source_url: hit.source_url,
            excerpt: hit.text_preview,
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(k);
    results
}
