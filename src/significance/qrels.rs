//! Relevance judgments for significance reports
//!
//! Report datasets use short names (`passage`, `scifact`). A rule table maps
//! each name to the catalog dataset holding its judgments and, optionally, a
//! minimum label below which a judgment counts as non-relevant.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::catalog::{DatasetCatalog, DatasetId, QrelRecord};
use crate::config::QrelsRule;
use crate::error::Result;

/// Graded judgments per query and document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QrelsTable {
    pub judgments: BTreeMap<String, BTreeMap<String, i32>>,
}

impl QrelsTable {
    /// Later records for the same (query, document) pair win
    pub fn from_records(records: impl IntoIterator<Item = QrelRecord>) -> Self {
        let mut judgments: BTreeMap<String, BTreeMap<String, i32>> = BTreeMap::new();
        for record in records {
            judgments
                .entry(record.query_id)
                .or_default()
                .insert(record.doc_id, record.label);
        }
        Self { judgments }
    }

    /// Set every label below `min_label` to 0
    pub fn clamp_below(&mut self, min_label: i32) {
        for labels in self.judgments.values_mut() {
            for label in labels.values_mut() {
                if *label < min_label {
                    *label = 0;
                }
            }
        }
    }

    pub fn query_ids(&self) -> BTreeSet<&str> {
        self.judgments.keys().map(String::as_str).collect()
    }

    pub fn query_count(&self) -> usize {
        self.judgments.len()
    }
}

/// Where a report dataset's judgments come from
#[derive(Debug, Clone, PartialEq)]
pub struct QrelsSource {
    pub dataset: DatasetId,
    pub min_relevant_label: Option<i32>,
}

/// Resolves and loads judgments for report datasets
pub struct QrelsLoader {
    catalog: Arc<dyn DatasetCatalog>,
    rules: Vec<QrelsRule>,
    fallback: String,
}

impl QrelsLoader {
    /// `fallback` is a catalog id template with a `{dataset}` placeholder
    pub fn new(catalog: Arc<dyn DatasetCatalog>, rules: Vec<QrelsRule>, fallback: String) -> Self {
        Self {
            catalog,
            rules,
            fallback,
        }
    }

    pub fn resolve(&self, dataset: &str) -> QrelsSource {
        match self.rules.iter().find(|rule| rule.dataset == dataset) {
            Some(rule) => QrelsSource {
                dataset: DatasetId::new(rule.source.clone()),
                min_relevant_label: rule.min_relevant_label,
            },
            None => QrelsSource {
                dataset: DatasetId::new(self.fallback.replace("{dataset}", dataset)),
                min_relevant_label: None,
            },
        }
    }

    pub fn load(&self, dataset: &str) -> Result<QrelsTable> {
        let source = self.resolve(dataset);
        let mut table = QrelsTable::from_records(self.catalog.qrels(&source.dataset)?);

        if let Some(min_label) = source.min_relevant_label {
            table.clamp_below(min_label);
        }

        tracing::info!(
            "Loaded qrels for {} from {} ({} queries{})",
            dataset,
            source.dataset,
            table.query_count(),
            source
                .min_relevant_label
                .map(|m| format!(", labels below {} set to 0", m))
                .unwrap_or_default()
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocalCatalog;
    use std::fs;

    fn record(q: &str, d: &str, label: i32) -> QrelRecord {
        QrelRecord {
            query_id: q.to_string(),
            doc_id: d.to_string(),
            label,
        }
    }

    fn default_rules() -> Vec<QrelsRule> {
        vec![QrelsRule {
            dataset: "passage".to_string(),
            source: "irds:msmarco-passage/trec-dl-2019".to_string(),
            min_relevant_label: Some(2),
        }]
    }

    #[test]
    fn test_passage_labels_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let qrels_dir = dir.path().join("msmarco-passage/trec-dl-2019");
        fs::create_dir_all(&qrels_dir).unwrap();
        fs::write(
            qrels_dir.join("qrels.tsv"),
            "q1 0 d0 0\nq1 0 d1 1\nq1 0 d2 2\nq1 0 d3 3\n",
        )
        .unwrap();

        let loader = QrelsLoader::new(
            Arc::new(LocalCatalog::new(dir.path())),
            default_rules(),
            "irds:beir/{dataset}/test".to_string(),
        );
        let table = loader.load("passage").unwrap();

        let labels: Vec<i32> = table.judgments["q1"].values().copied().collect();
        assert_eq!(labels, vec![0, 0, 2, 3]);
    }

    #[test]
    fn test_fallback_keeps_labels() {
        let dir = tempfile::tempdir().unwrap();
        let qrels_dir = dir.path().join("beir/scifact/qrels");
        fs::create_dir_all(&qrels_dir).unwrap();
        fs::write(qrels_dir.join("test.tsv"), "query-id\tcorpus-id\tscore\nq1\td1\t1\n").unwrap();

        let loader = QrelsLoader::new(
            Arc::new(LocalCatalog::new(dir.path())),
            default_rules(),
            "irds:beir/{dataset}/test".to_string(),
        );
        assert_eq!(
            loader.resolve("scifact"),
            QrelsSource {
                dataset: DatasetId::new("irds:beir/scifact/test"),
                min_relevant_label: None
            }
        );
        let table = loader.load("scifact").unwrap();
        assert_eq!(table.judgments["q1"]["d1"], 1);
    }

    #[test]
    fn test_from_records_last_wins() {
        let table = QrelsTable::from_records(vec![
            record("q1", "d1", 1),
            record("q2", "d1", 0),
            record("q1", "d1", 3),
        ]);
        assert_eq!(table.query_count(), 2);
        assert_eq!(table.judgments["q1"]["d1"], 3);
        assert_eq!(table.query_ids().into_iter().collect::<Vec<_>>(), vec!["q1", "q2"]);
    }
}
