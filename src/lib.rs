//! fildex - cross-modal file embedding and nearest-neighbor search
//!
//! Embeds heterogeneous files (images, PDFs, text documents) into two
//! vector spaces: a 512-dim shared image/text space and a 384-dim
//! text-only space. Records are stored in LanceDB with per-collection
//! namespaces and source-URL deduplication; textual queries fan out to
//! both spaces and the ranked results are fused.
//!
//! The surrounding service layer (HTTP routes, model downloading, remote
//! file acquisition) is an external consumer of [`engine::IndexEngine`].

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod namespace;
pub mod parser;

pub use config::EngineConfig;
pub use embedding::{
    CollectionInfo, Embedder, EmbeddingRecord, InsertOutcome, Modality, ModalityEncoder,
    QueryHit, VectorSpace, VectorStore,
};
pub use engine::{IndexEngine, IngestFile, IngestReport, SearchResult};
pub use error::{EngineError, EngineResult};
