//! Dataset catalog
//!
//! Resolves a dataset identifier into lazy document and query streams and a
//! set of relevance judgments. The indexing and significance pipelines only
//! see the [`DatasetCatalog`] trait; [`LocalCatalog`] reads BEIR-style files
//! from a directory tree.

mod local;

pub use local::LocalCatalog;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{PipelineError, Result};

/// Opaque dataset identifier (for example `irds:beir/scifact/test`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative catalog path: the `irds:` prefix is dropped and each `/`
    /// separated component becomes a directory
    pub fn relative_path(&self) -> Result<PathBuf> {
        let stripped = self.0.strip_prefix("irds:").unwrap_or(&self.0);
        let mut path = PathBuf::new();
        for component in stripped.split('/') {
            if component.is_empty()
                || component == "."
                || component == ".."
                || component.contains('\\')
            {
                return Err(PipelineError::InvalidDatasetId(self.0.clone()));
            }
            path.push(component);
        }
        Ok(path)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A corpus document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub text: String,
}

/// A query with its text
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub id: String,
    pub text: String,
}

/// One relevance judgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrelRecord {
    pub query_id: String,
    pub doc_id: String,
    pub label: i32,
}

pub type DocumentStream = Box<dyn Iterator<Item = Result<Document>> + Send>;
pub type QueryStream = Box<dyn Iterator<Item = Result<Query>> + Send>;

/// Source of datasets
///
/// Each call opens a fresh stream, so callers may iterate a dataset more than
/// once.
pub trait DatasetCatalog: Send + Sync {
    fn documents(&self, dataset: &DatasetId) -> Result<DocumentStream>;

    fn queries(&self, dataset: &DatasetId) -> Result<QueryStream>;

    fn qrels(&self, dataset: &DatasetId) -> Result<Vec<QrelRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        let id = DatasetId::new("irds:beir/scifact/test");
        assert_eq!(id.relative_path().unwrap(), PathBuf::from("beir/scifact/test"));

        let id = DatasetId::new("msmarco-passage");
        assert_eq!(id.relative_path().unwrap(), PathBuf::from("msmarco-passage"));
    }

    #[test]
    fn test_relative_path_rejects_traversal() {
        for bad in ["irds:../etc", "a//b", "", "irds:", "a/./b", "a\\b"] {
            let id = DatasetId::new(bad);
            assert!(
                matches!(id.relative_path(), Err(PipelineError::InvalidDatasetId(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
