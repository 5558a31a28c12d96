//! LanceDB storage operations
//!
//! One LanceDB table per collection. Every table declares both named
//! vector spaces (`image_vector` 512, `text_vector` 384) plus the scalar
//! fields of [`EmbeddingRecord`], so a single schema holds both
//! modalities; the inactive space of each record holds a zero placeholder
//! and every query applies a mandatory modality filter to hide it.

use std::sync::Arc;

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures_util::TryStreamExt;
use lancedb::arrow::SendableRecordBatchStream;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Error as LanceError, Table};

use super::{
    EmbeddingRecord, Modality, VectorSpace, COLUMN_DISTANCE, COLUMN_FILENAME, COLUMN_ID,
    COLUMN_IMAGE_VECTOR, COLUMN_MODALITY, COLUMN_SOURCE_URL, COLUMN_TEXT_PREVIEW,
    COLUMN_TEXT_VECTOR, COLUMN_TIMESTAMP,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Outcome of an insert attempt. A duplicate `source_url` is a defined
/// success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Skipped,
}

/// One nearest-neighbor hit, distance as reported by the store
/// (cosine distance, in [0, 2] over unit vectors).
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub modality: Modality,
    pub source_url: String,
    pub filename: String,
    pub text_preview: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionInfo {
    pub exists: bool,
    pub count: usize,
}

/// Durable, queryable storage of embedding records, partitioned by
/// collection. The connection is established once at construction;
/// failure there is fatal for all store operations.
pub struct VectorStore {
    conn: Connection,
    schema: Arc<Schema>,
}

impl VectorStore {
    pub async fn connect(config: &EngineConfig) -> EngineResult<Self> {
        let conn = connect(&config.lancedb_path)
            .execute()
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        let schema = build_schema(config)?;
        Ok(Self { conn, schema })
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    /// Create the collection's table if it does not exist yet. Idempotent:
    /// a concurrent creator winning the race is observed as "already
    /// exists" and is not an error.
    pub async fn ensure_collection(&self, collection: &str) -> EngineResult<()> {
        match self.conn.open_table(collection).execute().await {
            Ok(_) => Ok(()),
            Err(LanceError::TableNotFound { .. }) => {
                match self
                    .conn
                    .create_empty_table(collection, self.schema.clone())
                    .execute()
                    .await
                {
                    Ok(_) => {
                        tracing::debug!(collection = %collection, "Collection created");
                        Ok(())
                    }
                    Err(LanceError::TableAlreadyExists { .. }) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dedup check: exact match on `source_url` within the collection,
    /// limited to one row.
    pub async fn exists(&self, collection: &str, source_url: &str) -> EngineResult<bool> {
        let Some(table) = self.open_table(collection).await? else {
            return Ok(false);
        };

        let filter = format!(
            "{} = '{}'",
            COLUMN_SOURCE_URL,
            escape_literal(source_url)
        );
        let mut stream = table
            .query()
            .only_if(filter)
            .limit(1)
            .execute()
            .await?;

        while let Some(batch) = stream.try_next().await? {
            if batch.num_rows() > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write a record unless its `source_url` is already present.
    ///
    /// The exists-then-insert sequence is not atomic against a concurrent
    /// insert of the same URL; the worst case under that race is a
    /// duplicate record, not corruption. Callers that need exact dedup
    /// under concurrency serialize their own batches.
    pub async fn insert(
        &self,
        collection: &str,
        record: &EmbeddingRecord,
    ) -> EngineResult<InsertOutcome> {
        self.check_record_dims(record)?;

        if self.exists(collection, &record.source_url).await? {
            tracing::debug!(
                collection = %collection,
                source_url = %record.source_url,
                "Duplicate source_url, insert skipped"
            );
            return Ok(InsertOutcome::Skipped);
        }

        let table = self.open_table(collection).await?.ok_or_else(|| {
            EngineError::Validation(format!("collection {} does not exist", collection))
        })?;

        let batch = build_record_batch(self.schema.clone(), std::slice::from_ref(record))?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        table.add(batches).execute().await?;

        tracing::debug!(
            collection = %collection,
            source_url = %record.source_url,
            modality = record.modality.label(),
            "Record inserted"
        );
        Ok(InsertOutcome::Inserted)
    }

    /// Nearest-neighbor query against one named vector space, ordered
    /// ascending by cosine distance, at most `k` rows.
    ///
    /// The modality filter is always applied: placeholder zero vectors of
    /// the other modality must never surface in results.
    pub async fn query_nearest(
        &self,
        collection: &str,
        space: VectorSpace,
        query_vector: Vec<f32>,
        k: usize,
        modality_filter: Modality,
    ) -> EngineResult<Vec<QueryHit>> {
        let Some(table) = self.open_table(collection).await? else {
            return Ok(Vec::new());
        };

        let filter = format!("{} = '{}'", COLUMN_MODALITY, modality_filter.label());
        let stream = table
            .query()
            .nearest_to(query_vector)?
            .column(space.column())
            .distance_type(DistanceType::Cosine)
            .only_if(filter)
            .limit(k)
            .execute()
            .await?;

        collect_hits(stream).await
    }

    /// Remove all records and the schema of a collection. Irreversible.
    /// Removing a collection that never existed is a no-op.
    pub async fn delete_collection(&self, collection: &str) -> EngineResult<()> {
        match self.conn.drop_table(collection).await {
            Ok(()) => Ok(()),
            Err(LanceError::TableNotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_collections(&self) -> EngineResult<Vec<String>> {
        Ok(self.conn.table_names().execute().await?)
    }

    pub async fn collection_info(&self, collection: &str) -> EngineResult<CollectionInfo> {
        let Some(table) = self.open_table(collection).await? else {
            return Ok(CollectionInfo {
                exists: false,
                count: 0,
            });
        };
        let count = table.count_rows(None).await?;
        Ok(CollectionInfo {
            exists: true,
            count,
        })
    }

    async fn open_table(&self, collection: &str) -> EngineResult<Option<Table>> {
        match self.conn.open_table(collection).execute().await {
            Ok(table) => Ok(Some(table)),
            Err(LanceError::TableNotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn check_record_dims(&self, record: &EmbeddingRecord) -> EngineResult<()> {
        let (image_dim, text_dim) = schema_dims(&self.schema)?;
        if record.image_vector.len() != image_dim {
            return Err(EngineError::Validation(format!(
                "image_vector size mismatch: got {}, expected {}",
                record.image_vector.len(),
                image_dim
            )));
        }
        if record.text_vector.len() != text_dim {
            return Err(EngineError::Validation(format!(
                "text_vector size mismatch: got {}, expected {}",
                record.text_vector.len(),
                text_dim
            )));
        }
        Ok(())
    }
}

pub(crate) fn build_schema(config: &EngineConfig) -> EngineResult<Arc<Schema>> {
    let image_dim = i32::try_from(config.image_vector_size)
        .map_err(|_| EngineError::Validation("image_vector_size overflow".to_string()))?;
    let text_dim = i32::try_from(config.text_vector_size)
        .map_err(|_| EngineError::Validation("text_vector_size overflow".to_string()))?;

    let image_vector = DataType::FixedSizeList(
        Arc::new(Field::new("item", DataType::Float32, true)),
        image_dim,
    );
    let text_vector = DataType::FixedSizeList(
        Arc::new(Field::new("item", DataType::Float32, true)),
        text_dim,
    );

    Ok(Arc::new(Schema::new(vec![
        Field::new(COLUMN_ID, DataType::Utf8, false),
        Field::new(COLUMN_MODALITY, DataType::Utf8, false),
        Field::new(COLUMN_SOURCE_URL, DataType::Utf8, false),
        Field::new(COLUMN_FILENAME, DataType::Utf8, false),
        Field::new(COLUMN_TEXT_PREVIEW, DataType::Utf8, false),
        Field::new(COLUMN_TIMESTAMP, DataType::Utf8, false),
        Field::new(COLUMN_IMAGE_VECTOR, image_vector, false),
        Field::new(COLUMN_TEXT_VECTOR, text_vector, false),
    ])))
}

fn schema_dims(schema: &Schema) -> EngineResult<(usize, usize)> {
    let dim_of = |column: &str| -> EngineResult<usize> {
        match schema.field_with_name(column)?.data_type() {
            DataType::FixedSizeList(_, size) => Ok(*size as usize),
            _ => Err(EngineError::Validation(format!(
                "{} is not a fixed size list",
                column
            ))),
        }
    };
    Ok((dim_of(COLUMN_IMAGE_VECTOR)?, dim_of(COLUMN_TEXT_VECTOR)?))
}

pub(crate) fn build_record_batch(
    schema: Arc<Schema>,
    records: &[EmbeddingRecord],
) -> EngineResult<RecordBatch> {
    let ids = StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()));
    let modalities = StringArray::from_iter_values(records.iter().map(|r| r.modality.label()));
    let source_urls = StringArray::from_iter_values(records.iter().map(|r| r.source_url.as_str()));
    let filenames = StringArray::from_iter_values(records.iter().map(|r| r.filename.as_str()));
    let previews = StringArray::from_iter_values(records.iter().map(|r| r.text_preview.as_str()));
    let timestamps = StringArray::from_iter_values(records.iter().map(|r| r.timestamp.as_str()));

    let (image_dim, text_dim) = schema_dims(&schema)?;
    let image_vectors = build_vector_column(records.iter().map(|r| &r.image_vector), image_dim)?;
    let text_vectors = build_vector_column(records.iter().map(|r| &r.text_vector), text_dim)?;

    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(modalities),
            Arc::new(source_urls),
            Arc::new(filenames),
            Arc::new(previews),
            Arc::new(timestamps),
            Arc::new(image_vectors),
            Arc::new(text_vectors),
        ],
    )?)
}

fn build_vector_column<'a>(
    vectors: impl ExactSizeIterator<Item = &'a Vec<f32>>,
    dim: usize,
) -> EngineResult<arrow_array::FixedSizeListArray> {
    let rows = vectors.len();
    let mut builder = FixedSizeListBuilder::with_capacity(
        Float32Builder::with_capacity(rows * dim),
        dim as i32,
        rows,
    );

    for vector in vectors {
        if vector.len() != dim {
            return Err(EngineError::Validation(
                "embedding vector size mismatch".to_string(),
            ));
        }
        builder.values().append_slice(vector);
        builder.append(true);
    }

    Ok(builder.finish())
}

async fn collect_hits(mut stream: SendableRecordBatchStream) -> EngineResult<Vec<QueryHit>> {
    let mut hits = Vec::new();

    while let Some(batch) = stream.try_next().await? {
        if batch.num_rows() == 0 {
            continue;
        }

        let ids = string_column(&batch, COLUMN_ID)?;
        let modalities = string_column(&batch, COLUMN_MODALITY)?;
        let source_urls = string_column(&batch, COLUMN_SOURCE_URL)?;
        let filenames = string_column(&batch, COLUMN_FILENAME)?;
        let previews = string_column(&batch, COLUMN_TEXT_PREVIEW)?;

        let distances = batch
            .column_by_name(COLUMN_DISTANCE)
            .ok_or_else(|| EngineError::Validation("query result missing _distance".to_string()))?
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| EngineError::Validation("_distance column type mismatch".to_string()))?;

        for row in 0..batch.num_rows() {
            let modality = Modality::parse(modalities.value(row)).ok_or_else(|| {
                EngineError::Validation(format!("unknown modality: {}", modalities.value(row)))
            })?;
            hits.push(QueryHit {
                id: ids.value(row).to_string(),
                modality,
                source_url: source_urls.value(row).to_string(),
                filename: filenames.value(row).to_string(),
                text_preview: previews.value(row).to_string(),
                distance: distances.value(row),
            });
        }
    }

    Ok(hits)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> EngineResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| EngineError::Validation(format!("query result missing {}", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| EngineError::Validation(format!("{} column type mismatch", name)))
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use uuid::Uuid;

    use super::*;
    use crate::embedding::l2_normalize;

    fn test_config(path: &std::path::Path) -> EngineConfig {
        EngineConfig {
            lancedb_path: path.to_string_lossy().to_string(),
            image_vector_size: 8,
            text_vector_size: 4,
            ..EngineConfig::default()
        }
    }

    fn unit_vector(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis % dim] = 1.0;
        v
    }

    fn image_record(source_url: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: Uuid::new_v4().to_string(),
            modality: Modality::Image,
            source_url: source_url.to_string(),
            filename: "photo.png".to_string(),
            text_preview: String::new(),
            image_vector: vector,
            text_vector: vec![0.0; 4],
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn text_record(source_url: &str, vector: Vec<f32>, preview: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            id: Uuid::new_v4().to_string(),
            modality: Modality::Text,
            source_url: source_url.to_string(),
            filename: "notes.txt".to_string(),
            text_preview: preview.to_string(),
            image_vector: vec![0.0; 8],
            text_vector: vector,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn ensure_collection_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();

        store.ensure_collection("Myphotos").await.unwrap();
        store.ensure_collection("Myphotos").await.unwrap();

        let names = store.list_collections().await.unwrap();
        assert_eq!(names.iter().filter(|n| *n == "Myphotos").count(), 1);
    }

    #[tokio::test]
    async fn duplicate_source_url_is_skipped() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Docs").await.unwrap();

        let first = image_record("ipfs://a", unit_vector(8, 0));
        assert_eq!(
            store.insert("Docs", &first).await.unwrap(),
            InsertOutcome::Inserted
        );

        let second = image_record("ipfs://a", unit_vector(8, 1));
        assert_eq!(
            store.insert("Docs", &second).await.unwrap(),
            InsertOutcome::Skipped
        );

        let info = store.collection_info("Docs").await.unwrap();
        assert_eq!(info, CollectionInfo { exists: true, count: 1 });
    }

    #[tokio::test]
    async fn exists_handles_quoted_urls() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Docs").await.unwrap();

        let record = text_record("https://x/it's here.txt", unit_vector(4, 0), "hi");
        store.insert("Docs", &record).await.unwrap();

        assert!(store.exists("Docs", "https://x/it's here.txt").await.unwrap());
        assert!(!store.exists("Docs", "https://x/other.txt").await.unwrap());
    }

    #[tokio::test]
    async fn modality_filter_hides_placeholders() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Mixed").await.unwrap();

        store
            .insert("Mixed", &image_record("u://img", unit_vector(8, 0)))
            .await
            .unwrap();
        store
            .insert("Mixed", &text_record("u://txt", unit_vector(4, 0), "body"))
            .await
            .unwrap();

        let image_hits = store
            .query_nearest("Mixed", VectorSpace::Image, unit_vector(8, 0), 10, Modality::Image)
            .await
            .unwrap();
        assert_eq!(image_hits.len(), 1);
        assert_eq!(image_hits[0].modality, Modality::Image);
        assert_eq!(image_hits[0].source_url, "u://img");

        let text_hits = store
            .query_nearest("Mixed", VectorSpace::Text, unit_vector(4, 0), 10, Modality::Text)
            .await
            .unwrap();
        assert_eq!(text_hits.len(), 1);
        assert_eq!(text_hits[0].modality, Modality::Text);

        // Even a query perfectly aligned with the zero placeholder must not
        // surface the other modality.
        let cross = store
            .query_nearest("Mixed", VectorSpace::Image, unit_vector(8, 3), 10, Modality::Image)
            .await
            .unwrap();
        assert!(cross.iter().all(|hit| hit.modality == Modality::Image));
    }

    #[tokio::test]
    async fn query_orders_by_distance_and_respects_k() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Rank").await.unwrap();

        let mut near = vec![1.0, 0.2, 0.0, 0.0];
        l2_normalize(&mut near);
        let mut far = vec![0.0, 1.0, 0.0, 0.0];
        l2_normalize(&mut far);

        store
            .insert("Rank", &text_record("u://near", near, ""))
            .await
            .unwrap();
        store
            .insert("Rank", &text_record("u://far", far, ""))
            .await
            .unwrap();
        store
            .insert("Rank", &text_record("u://exact", unit_vector(4, 0), ""))
            .await
            .unwrap();

        let hits = store
            .query_nearest("Rank", VectorSpace::Text, unit_vector(4, 0), 2, Modality::Text)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source_url, "u://exact");
        assert_eq!(hits[1].source_url, "u://near");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn missing_collection_yields_empty_results() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();

        let hits = store
            .query_nearest("Nowhere", VectorSpace::Text, unit_vector(4, 0), 5, Modality::Text)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let info = store.collection_info("Nowhere").await.unwrap();
        assert_eq!(info, CollectionInfo { exists: false, count: 0 });
        assert!(!store.exists("Nowhere", "u://x").await.unwrap());
    }

    #[tokio::test]
    async fn delete_collection_removes_schema_and_records() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Gone").await.unwrap();
        store
            .insert("Gone", &text_record("u://a", unit_vector(4, 0), ""))
            .await
            .unwrap();

        store.delete_collection("Gone").await.unwrap();
        let info = store.collection_info("Gone").await.unwrap();
        assert!(!info.exists);

        // Deleting again is a no-op.
        store.delete_collection("Gone").await.unwrap();
    }

    #[tokio::test]
    async fn insert_rejects_wrong_dimensions() {
        let dir = tempdir().unwrap();
        let store = VectorStore::connect(&test_config(dir.path())).await.unwrap();
        store.ensure_collection("Dims").await.unwrap();

        let bad = image_record("u://bad", vec![1.0; 3]);
        assert!(matches!(
            store.insert("Dims", &bad).await,
            Err(EngineError::Validation(_))
        ));
    }
}
