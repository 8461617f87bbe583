//! Collection indexing
//!
//! Encodes a dataset's documents and queries and stores the vectors as a
//! dense index artifact. Runs in two passes over the document stream:
//! identifier validation first, so a bad id fails the job before any model
//! time is spent, then batched encoding.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::artifact::{artifact_dir, DenseIndexWriter, IndexMetadata};
use super::runner::CancellationFlag;
use crate::catalog::{DatasetCatalog, DatasetId};
use crate::config::{AggregationMode, IndexJobConfig, IndexingConfig};
use crate::encoders::{Encoder, EncoderPair};
use crate::error::{PipelineError, Result};
use crate::resource_monitor::{ResourceMetrics, ResourceMonitor};

/// Log progress every this many batches
const PROGRESS_EVERY_BATCHES: usize = 500;

/// Id validation looks at the cancellation flag every this many documents
const CANCEL_CHECK_EVERY: usize = 1024;

/// A fully resolved indexing job
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub dataset: DatasetId,
    pub model_name: String,
    pub embedding_dim: usize,
    pub max_id_length: usize,
    pub batch_size: usize,
    pub aggregation_mode: AggregationMode,
    /// Root index directory; the artifact lands in a subdirectory
    pub output_dir: PathBuf,
}

impl IndexJob {
    pub fn from_config(job: &IndexJobConfig, indexing: &IndexingConfig) -> Self {
        Self {
            dataset: DatasetId::new(job.dataset.clone()),
            model_name: job.model.clone(),
            embedding_dim: job.embedding_dim,
            max_id_length: job.max_id_length,
            batch_size: indexing.batch_size,
            aggregation_mode: indexing.aggregation_mode,
            output_dir: indexing.index_dir.clone(),
        }
    }

    pub fn artifact_dir(&self) -> Result<PathBuf> {
        artifact_dir(&self.output_dir, &self.dataset, &self.model_name)
    }

    pub fn label(&self) -> String {
        format!("{} / {}", self.dataset, self.model_name)
    }

    fn metadata(&self) -> IndexMetadata {
        IndexMetadata {
            dataset: self.dataset.clone(),
            model: self.model_name.clone(),
            embedding_dim: self.embedding_dim,
            aggregation_mode: self.aggregation_mode,
            max_id_length: self.max_id_length,
        }
    }
}

/// What a successful job produced
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub dataset: DatasetId,
    pub model: String,
    pub artifact_dir: PathBuf,
    pub document_count: usize,
    pub query_count: usize,
    pub embedding_dim: usize,
    pub duration: Duration,
    pub resources: ResourceMetrics,
}

/// Builds dense index artifacts from catalog datasets
pub struct CollectionIndexer {
    catalog: Arc<dyn DatasetCatalog>,
}

impl CollectionIndexer {
    pub fn new(catalog: Arc<dyn DatasetCatalog>) -> Self {
        Self { catalog }
    }

    /// Pass 1: check every document id without encoding anything
    ///
    /// Returns the number of documents. Blocks on catalog I/O; stops with
    /// `Cancelled` soon after `cancel` is raised.
    pub fn validate_ids(&self, job: &IndexJob, cancel: &CancellationFlag) -> Result<usize> {
        validate_ids(self.catalog.as_ref(), job, cancel)
    }

    /// Encode the dataset and write its artifact
    ///
    /// `monitor` should already hold the baseline and model load snapshots.
    /// Nothing is written at the artifact location unless every document
    /// and query was encoded.
    pub async fn index(
        &self,
        job: &IndexJob,
        encoders: &EncoderPair,
        monitor: ResourceMonitor,
        cancel: &CancellationFlag,
    ) -> Result<IndexSummary> {
        let start = Instant::now();

        if job.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        for encoder in [&encoders.query, &encoders.document] {
            if encoder.dimensions() != job.embedding_dim {
                return Err(PipelineError::DimensionMismatch {
                    context: encoder.name().to_string(),
                    expected: job.embedding_dim,
                    actual: encoder.dimensions(),
                });
            }
        }

        let expected_docs = {
            let catalog = Arc::clone(&self.catalog);
            let job = job.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || validate_ids(catalog.as_ref(), &job, &cancel))
                .await
                .map_err(std::io::Error::from)??
        };
        tracing::info!(
            "Validated {} document ids for {} (max length {})",
            expected_docs,
            job.label(),
            job.max_id_length
        );

        let target = job.artifact_dir()?;
        let mut writer = DenseIndexWriter::create(&target, job.metadata())?;
        let _sampling = monitor.start_sampling();
        let mut encode_time = Duration::ZERO;

        // Pass 2: documents
        let mut docs = self.catalog.documents(&job.dataset)?;
        let mut batches = 0usize;
        loop {
            let mut ids = Vec::with_capacity(job.batch_size);
            let mut texts = Vec::with_capacity(job.batch_size);
            for doc in docs.by_ref().take(job.batch_size) {
                let doc = doc?;
                // The stream is reopened, so ids are checked again
                check_id(&doc.id, job.max_id_length)?;
                ids.push(doc.id);
                texts.push(doc.text);
            }
            if ids.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                tracing::warn!(
                    "Indexing of {} cancelled after {} documents",
                    job.label(),
                    writer.document_count()
                );
                return Err(PipelineError::Cancelled);
            }

            let (vectors, duration) =
                encode_checked(encoders.document.as_ref(), &ids, &texts, job.embedding_dim).await?;
            encode_time += duration;
            for (id, vector) in ids.iter().zip(&vectors) {
                writer.append_document(id, vector)?;
            }

            batches += 1;
            if batches % PROGRESS_EVERY_BATCHES == 0 {
                tracing::info!(
                    "{}: {}/{} documents encoded",
                    job.label(),
                    writer.document_count(),
                    expected_docs
                );
            }
        }

        // Queries
        let mut queries = self.catalog.queries(&job.dataset)?;
        let mut query_count = 0usize;
        loop {
            let mut ids = Vec::with_capacity(job.batch_size);
            let mut texts = Vec::with_capacity(job.batch_size);
            for query in queries.by_ref().take(job.batch_size) {
                let query = query?;
                ids.push(query.id);
                texts.push(query.text);
            }
            if ids.is_empty() {
                break;
            }
            if cancel.is_cancelled() {
                tracing::warn!("Indexing of {} cancelled while encoding queries", job.label());
                return Err(PipelineError::Cancelled);
            }

            let (vectors, duration) =
                encode_checked(encoders.query.as_ref(), &ids, &texts, job.embedding_dim).await?;
            encode_time += duration;
            for (id, vector) in ids.iter().zip(&vectors) {
                writer.append_query(id, vector)?;
            }
            query_count += ids.len();
        }

        let resources = monitor.finalize(encode_time, writer.document_count() + query_count);
        tracing::info!("{}: {}", job.label(), resources.format_summary());

        let manifest = writer.commit(Some(resources.clone()))?;

        Ok(IndexSummary {
            dataset: job.dataset.clone(),
            model: job.model_name.clone(),
            artifact_dir: target,
            document_count: manifest.document_count,
            query_count: manifest.query_count,
            embedding_dim: job.embedding_dim,
            duration: start.elapsed(),
            resources,
        })
    }
}

fn validate_ids(
    catalog: &dyn DatasetCatalog,
    job: &IndexJob,
    cancel: &CancellationFlag,
) -> Result<usize> {
    let mut count = 0;
    for doc in catalog.documents(&job.dataset)? {
        if count % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
            tracing::warn!("Id validation of {} cancelled after {} documents", job.label(), count);
            return Err(PipelineError::Cancelled);
        }
        let doc = doc?;
        check_id(&doc.id, job.max_id_length)?;
        count += 1;
    }
    Ok(count)
}

fn check_id(id: &str, max_id_length: usize) -> Result<()> {
    let length = id.chars().count();
    if length == 0 || length > max_id_length {
        return Err(PipelineError::IdentifierTooLong {
            id: id.to_string(),
            length,
            max: max_id_length,
        });
    }
    Ok(())
}

/// Encode one batch and check the vector count and lengths
async fn encode_checked(
    encoder: &dyn Encoder,
    ids: &[String],
    texts: &[String],
    embedding_dim: usize,
) -> Result<(Vec<Vec<f32>>, Duration)> {
    let result = encoder.encode(texts).await?;
    if result.embeddings.len() != texts.len() {
        return Err(PipelineError::Encoder(format!(
            "{} returned {} vectors for {} texts",
            encoder.name(),
            result.embeddings.len(),
            texts.len()
        )));
    }
    for (id, vector) in ids.iter().zip(&result.embeddings) {
        if vector.len() != embedding_dim {
            return Err(PipelineError::DimensionMismatch {
                context: format!("{} output for '{}'", encoder.name(), id),
                expected: embedding_dim,
                actual: vector.len(),
            });
        }
    }
    Ok((result.embeddings, result.duration))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::LocalCatalog;
    use crate::encoders::{BatchEmbeddingResult, ComputeDevice, EncoderConfig, EncoderRole};
    use crate::indexing::artifact::DenseIndex;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::fs;
    use std::path::Path;

    /// Deterministic encoder: each text maps to a vector derived from its hash
    pub(crate) struct HashEncoder {
        config: EncoderConfig,
        output_dim: usize,
    }

    impl HashEncoder {
        pub(crate) fn new(role: EncoderRole, dim: usize) -> Self {
            Self::with_output_dim(role, dim, dim)
        }

        /// Claims `dim` but produces `output_dim` components
        pub(crate) fn with_output_dim(role: EncoderRole, dim: usize, output_dim: usize) -> Self {
            Self {
                config: EncoderConfig {
                    name: format!("hash-{}-{}", role.name(), dim),
                    backend: "test".to_string(),
                    model_name: "hash".to_string(),
                    embedding_dim: dim,
                    device: ComputeDevice::Cpu,
                    role,
                    notes: None,
                },
                output_dim,
            }
        }

        pub(crate) fn pair(dim: usize) -> EncoderPair {
            EncoderPair::new(
                Arc::new(Self::new(EncoderRole::Query, dim)),
                Arc::new(Self::new(EncoderRole::Document, dim)),
            )
        }
    }

    #[async_trait]
    impl Encoder for HashEncoder {
        fn config(&self) -> &EncoderConfig {
            &self.config
        }

        async fn encode(&self, texts: &[String]) -> Result<BatchEmbeddingResult> {
            let embeddings = texts
                .iter()
                .map(|t| {
                    let digest = Sha256::digest(t.as_bytes());
                    (0..self.output_dim)
                        .map(|i| digest[i % digest.len()] as f32 / 255.0)
                        .collect()
                })
                .collect();
            Ok(BatchEmbeddingResult {
                embeddings,
                duration: Duration::from_micros(10),
                avg_duration: Duration::from_micros(1),
            })
        }
    }

    fn write_dataset(root: &Path, doc_ids: &[&str]) {
        let dir = root.join("toy");
        fs::create_dir_all(&dir).unwrap();
        let corpus: String = doc_ids
            .iter()
            .map(|id| format!("{{\"_id\": \"{}\", \"text\": \"passage {}\"}}\n", id, id))
            .collect();
        fs::write(dir.join("corpus.jsonl"), corpus).unwrap();
        fs::write(
            dir.join("queries.jsonl"),
            "{\"_id\": \"q1\", \"text\": \"first\"}\n{\"_id\": \"q2\", \"text\": \"second\"}\n",
        )
        .unwrap();
    }

    fn job(root: &Path, dim: usize) -> IndexJob {
        IndexJob {
            dataset: DatasetId::new("irds:toy"),
            model_name: "hash".to_string(),
            embedding_dim: dim,
            max_id_length: 7,
            batch_size: 2,
            aggregation_mode: AggregationMode::MaxP,
            output_dir: root.join("index"),
        }
    }

    fn indexer(root: &Path) -> CollectionIndexer {
        CollectionIndexer::new(Arc::new(LocalCatalog::new(root.join("data"))))
    }

    #[tokio::test]
    async fn test_indexes_three_documents() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(&dir.path().join("data"), &["1", "22", "7654321"]);
        let job = job(dir.path(), 384);

        let summary = indexer(dir.path())
            .index(&job, &HashEncoder::pair(384), ResourceMonitor::new(), &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(summary.document_count, 3);
        assert_eq!(summary.query_count, 2);

        let index = DenseIndex::open(&summary.artifact_dir).unwrap();
        assert_eq!(index.documents.len(), 3);
        assert!(index.documents.iter().all(|r| r.vector.len() == 384));
        assert_eq!(index.queries[1].id, "q2");
    }

    #[tokio::test]
    async fn test_vectors_match_configured_dimension() {
        for dim in [384, 768] {
            let dir = tempfile::tempdir().unwrap();
            write_dataset(&dir.path().join("data"), &["a", "b", "c", "d", "e"]);
            let job = job(dir.path(), dim);

            let summary = indexer(dir.path())
                .index(&job, &HashEncoder::pair(dim), ResourceMonitor::new(), &CancellationFlag::new())
                .await
                .unwrap();
            let index = DenseIndex::open(&summary.artifact_dir).unwrap();
            assert_eq!(index.manifest.metadata.embedding_dim, dim);
            assert!(index
                .documents
                .iter()
                .chain(&index.queries)
                .all(|r| r.vector.len() == dim));
        }
    }

    #[tokio::test]
    async fn test_too_long_id_fails_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(&dir.path().join("data"), &["1", "12345678", "3"]);
        let job = job(dir.path(), 384);

        let err = indexer(dir.path())
            .index(&job, &HashEncoder::pair(384), ResourceMonitor::new(), &CancellationFlag::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::IdentifierTooLong { id, length, max } => {
                assert_eq!(id, "12345678");
                assert_eq!(length, 8);
                assert_eq!(max, 7);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!job.artifact_dir().unwrap().exists());
        assert!(!job.output_dir.exists());
    }

    #[tokio::test]
    async fn test_wrong_encoder_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(&dir.path().join("data"), &["a", "b"]);
        let job = job(dir.path(), 384);
        let encoders = EncoderPair::new(
            Arc::new(HashEncoder::new(EncoderRole::Query, 384)),
            Arc::new(HashEncoder::with_output_dim(EncoderRole::Document, 384, 383)),
        );

        let err = indexer(dir.path())
            .index(&job, &encoders, ResourceMonitor::new(), &CancellationFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch { expected: 384, actual: 383, .. }
        ));
        assert!(!job.artifact_dir().unwrap().exists());
    }

    #[tokio::test]
    async fn test_cancelled_job_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(&dir.path().join("data"), &["a", "b", "c"]);
        let job = job(dir.path(), 8);
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let err = indexer(dir.path())
            .index(&job, &HashEncoder::pair(8), ResourceMonitor::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!job.artifact_dir().unwrap().exists());
    }

    #[test]
    fn test_id_validation_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..3000).map(|i| format!("d{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        write_dataset(&dir.path().join("data"), &refs);
        let job = job(dir.path(), 8);
        let indexer = indexer(dir.path());

        let cancel = CancellationFlag::new();
        assert_eq!(indexer.validate_ids(&job, &cancel).unwrap(), 3000);

        cancel.cancel();
        let err = indexer.validate_ids(&job, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_encoder_dimension_checked_upfront() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(&dir.path().join("data"), &["a"]);
        let job = job(dir.path(), 768);

        let err = indexer(dir.path())
            .index(&job, &HashEncoder::pair(384), ResourceMonitor::new(), &CancellationFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { expected: 768, .. }));
    }

    #[test]
    fn test_check_id() {
        assert!(check_id("1234567", 7).is_ok());
        assert!(check_id("", 7).is_err());
        // Length counts characters, not bytes
        assert!(check_id("ééé", 3).is_ok());
    }
}
