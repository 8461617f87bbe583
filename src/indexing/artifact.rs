//! On-disk dense index artifact
//!
//! One directory per (dataset, model):
//!
//! ```text
//! <index_dir>/<dataset path>/<model>/
//!     documents.bin    magic "DVIX", version byte, bincode (id, vector) records
//!     queries.bin      same layout
//!     manifest.json    metadata, record counts, SHA-256 of both .bin files
//! ```
//!
//! Artifacts are written into a staging directory next to the target and
//! renamed into place only after the manifest is on disk, so a target
//! directory is either complete or absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::catalog::DatasetId;
use crate::config::AggregationMode;
use crate::error::{PipelineError, Result};
use crate::resource_monitor::ResourceMetrics;

/// Magic bytes of vector record files: "DVIX" = Dense Vector IndeX
pub const INDEX_MAGIC: [u8; 4] = [0x44, 0x56, 0x49, 0x58];

/// Record file format version
pub const INDEX_FORMAT_VERSION: u8 = 1;

pub const DOCUMENTS_FILE: &str = "documents.bin";
pub const QUERIES_FILE: &str = "queries.bin";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding the artifact of `model` on `dataset`
pub fn artifact_dir(index_dir: &Path, dataset: &DatasetId, model: &str) -> Result<PathBuf> {
    let model_dir: String = model
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if model_dir.is_empty() || model_dir == "." || model_dir == ".." {
        return Err(PipelineError::InvalidConfig(format!(
            "invalid model name for an index directory: '{}'",
            model
        )));
    }
    Ok(index_dir.join(dataset.relative_path()?).join(model_dir))
}

/// One stored (id, vector) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
}

/// Static facts about an artifact, fixed before encoding starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub dataset: DatasetId,
    pub model: String,
    pub embedding_dim: usize,
    pub aggregation_mode: AggregationMode,
    pub max_id_length: usize,
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u8,
    #[serde(flatten)]
    pub metadata: IndexMetadata,
    pub document_count: usize,
    pub query_count: usize,
    pub documents_sha256: String,
    pub queries_sha256: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceMetrics>,
}

/// Writer that hashes everything passing through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Append-only record file writer
struct VectorFileWriter {
    out: HashingWriter<BufWriter<File>>,
    embedding_dim: usize,
    count: usize,
}

impl VectorFileWriter {
    fn create(path: &Path, embedding_dim: usize) -> Result<Self> {
        let mut out = HashingWriter {
            inner: BufWriter::new(File::create(path)?),
            hasher: Sha256::new(),
        };
        out.write_all(&INDEX_MAGIC)?;
        out.write_all(&[INDEX_FORMAT_VERSION])?;
        Ok(Self {
            out,
            embedding_dim,
            count: 0,
        })
    }

    fn append(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.embedding_dim {
            return Err(PipelineError::DimensionMismatch {
                context: format!("record '{}'", id),
                expected: self.embedding_dim,
                actual: vector.len(),
            });
        }
        bincode::serialize_into(&mut self.out, &(id, vector))?;
        self.count += 1;
        Ok(())
    }

    /// Flush to disk and return (record count, hex SHA-256)
    fn finish(mut self) -> Result<(usize, String)> {
        self.out.flush()?;
        self.out.inner.get_ref().sync_all()?;
        Ok((self.count, format!("{:x}", self.out.hasher.finalize())))
    }
}

/// Staged writer for one artifact
///
/// Dropping the writer without [`commit`](Self::commit) removes the staging
/// directory and leaves any existing artifact at the target untouched.
pub struct DenseIndexWriter {
    staging: TempDir,
    target: PathBuf,
    metadata: IndexMetadata,
    documents: VectorFileWriter,
    queries: VectorFileWriter,
}

impl DenseIndexWriter {
    /// Start a new artifact that will land at `target`
    pub fn create(target: &Path, metadata: IndexMetadata) -> Result<Self> {
        let parent = target.parent().ok_or_else(|| {
            PipelineError::InvalidConfig(format!("index target {:?} has no parent", target))
        })?;
        fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)?;
        tracing::debug!("Staging index for {:?} in {:?}", target, staging.path());

        let documents =
            VectorFileWriter::create(&staging.path().join(DOCUMENTS_FILE), metadata.embedding_dim)?;
        let queries =
            VectorFileWriter::create(&staging.path().join(QUERIES_FILE), metadata.embedding_dim)?;

        Ok(Self {
            staging,
            target: target.to_path_buf(),
            metadata,
            documents,
            queries,
        })
    }

    pub fn append_document(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        self.documents.append(id, vector)
    }

    pub fn append_query(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        self.queries.append(id, vector)
    }

    pub fn document_count(&self) -> usize {
        self.documents.count
    }

    /// Write the manifest and move the artifact into place
    ///
    /// An existing artifact at the target is replaced.
    pub fn commit(self, resources: Option<ResourceMetrics>) -> Result<IndexManifest> {
        let Self {
            staging,
            target,
            metadata,
            documents,
            queries,
        } = self;

        let (document_count, documents_sha256) = documents.finish()?;
        let (query_count, queries_sha256) = queries.finish()?;

        let manifest = IndexManifest {
            format_version: INDEX_FORMAT_VERSION,
            metadata,
            document_count,
            query_count,
            documents_sha256,
            queries_sha256,
            created_at: Utc::now(),
            resources,
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(staging.path().join(MANIFEST_FILE), json)?;

        if target.exists() {
            tracing::warn!("Replacing existing index at {:?}", target);
            fs::remove_dir_all(&target)?;
        }
        fs::rename(staging.path(), &target)?;
        // The guard's cleanup finds nothing left after the rename
        drop(staging);

        tracing::info!(
            "Index written to {:?} ({} documents, {} queries)",
            target,
            manifest.document_count,
            manifest.query_count
        );
        Ok(manifest)
    }
}

/// A verified, fully loaded artifact
#[derive(Debug, Clone)]
pub struct DenseIndex {
    pub manifest: IndexManifest,
    pub documents: Vec<VectorRecord>,
    pub queries: Vec<VectorRecord>,
}

impl DenseIndex {
    /// Load an artifact, verifying magic, version, checksums, counts and
    /// vector dimensionality
    pub fn open(dir: &Path) -> Result<Self> {
        let corrupt = |reason: String| PipelineError::CorruptIndex {
            path: dir.to_path_buf(),
            reason,
        };

        let manifest_json = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest: IndexManifest = serde_json::from_str(&manifest_json)
            .map_err(|e| corrupt(format!("unreadable manifest: {}", e)))?;
        if manifest.format_version != INDEX_FORMAT_VERSION {
            return Err(corrupt(format!(
                "manifest format version {} (expected {})",
                manifest.format_version, INDEX_FORMAT_VERSION
            )));
        }

        let dim = manifest.metadata.embedding_dim;
        let documents = read_vector_file(
            &dir.join(DOCUMENTS_FILE),
            manifest.document_count,
            dim,
            &manifest.documents_sha256,
        )
        .map_err(|reason| corrupt(format!("{}: {}", DOCUMENTS_FILE, reason)))?;
        let queries = read_vector_file(
            &dir.join(QUERIES_FILE),
            manifest.query_count,
            dim,
            &manifest.queries_sha256,
        )
        .map_err(|reason| corrupt(format!("{}: {}", QUERIES_FILE, reason)))?;

        Ok(Self {
            manifest,
            documents,
            queries,
        })
    }
}

fn read_vector_file(
    path: &Path,
    count: usize,
    dim: usize,
    expected_sha256: &str,
) -> std::result::Result<Vec<VectorRecord>, String> {
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| e.to_string())?;

    let actual_sha256 = format!("{:x}", Sha256::digest(&data));
    if actual_sha256 != expected_sha256 {
        return Err(format!(
            "checksum mismatch (expected {}, got {})",
            expected_sha256, actual_sha256
        ));
    }

    if data.len() < INDEX_MAGIC.len() + 1 || data[0..4] != INDEX_MAGIC {
        return Err("bad magic bytes".to_string());
    }
    if data[4] != INDEX_FORMAT_VERSION {
        return Err(format!(
            "format version {} (expected {})",
            data[4], INDEX_FORMAT_VERSION
        ));
    }

    let mut cursor = Cursor::new(&data[5..]);
    let mut records = Vec::with_capacity(count);
    for n in 0..count {
        let (id, vector): (String, Vec<f32>) = bincode::deserialize_from(&mut cursor)
            .map_err(|e| format!("record {}: {}", n, e))?;
        if vector.len() != dim {
            return Err(format!(
                "record '{}' has {} dimensions (expected {})",
                id,
                vector.len(),
                dim
            ));
        }
        records.push(VectorRecord { id, vector });
    }
    if (cursor.position() as usize) != data.len() - 5 {
        return Err("trailing bytes after last record".to_string());
    }

    Ok(records)
}
