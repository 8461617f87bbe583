//! Error taxonomy shared by both pipelines.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the indexing and significance pipelines.
///
/// Timeouts are not errors: they surface as `TaskOutcome::TimedOut` from
/// the runner.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model name does not match any known pretrained model family
    #[error("Unknown embedding model '{model}' (see `retrieval-bench models`)")]
    ModelResolution { model: String },

    /// Requested or produced vector length differs from the configured one
    #[error("Embedding dimension mismatch for '{context}': expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Document identifier exceeds the configured maximum length
    #[error("Document id '{id}' has length {length}, exceeding max_id_length {max}")]
    IdentifierTooLong { id: String, length: usize, max: usize },

    #[error("Invalid dataset id '{0}'")]
    InvalidDatasetId(String),

    #[error("Dataset '{dataset}' not found in catalog (looked for {path:?})")]
    DatasetNotFound { dataset: String, path: PathBuf },

    #[error("Run file not found: {path:?}")]
    RunFileNotFound { path: PathBuf },

    #[error("Malformed run line {line} in {path:?}: {reason}")]
    MalformedRunLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Malformed qrels line {line} in {path:?}: {reason}")]
    MalformedQrelsLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Malformed record on line {line} of {path:?}: {reason}")]
    MalformedDatasetRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Run and qrels cover different queries and make_comparable is off
    #[error(
        "Run '{system}' is not comparable with the qrels: {missing} queries missing, {extra} extra (enable make_comparable)"
    )]
    NotComparable {
        system: String,
        missing: usize,
        extra: usize,
    },

    #[error("Comparison error: {0}")]
    Comparison(String),

    /// Failure reported by the evaluation library
    #[error("Statistics error: {0}")]
    Statistics(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Indexing cancelled")]
    Cancelled,

    #[error("Corrupt index at {path:?}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
