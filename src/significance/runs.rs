//! TREC run files
//!
//! One file per system at `<trec_run_dir>/<dataset>/<model>.trec`, one
//! retrieved document per line:
//!
//! ```text
//! qid  Q0  docid  rank  score  tag
//! ```
//!
//! Rank and tag are ignored; only the score orders documents.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Scores one system assigned, per query and document
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub system: String,
    pub scores: BTreeMap<String, BTreeMap<String, f64>>,
}

impl RunRecord {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            scores: BTreeMap::new(),
        }
    }

    /// Insert a score; a repeated (query, document) pair overwrites
    pub fn insert(&mut self, query_id: &str, doc_id: &str, score: f64) {
        self.scores
            .entry(query_id.to_string())
            .or_default()
            .insert(doc_id.to_string(), score);
    }

    pub fn query_ids(&self) -> BTreeSet<&str> {
        self.scores.keys().map(String::as_str).collect()
    }

    pub fn query_count(&self) -> usize {
        self.scores.len()
    }
}

/// Parse a run from any line source
pub fn parse_run<R: BufRead>(reader: R, system: &str, path: &Path) -> Result<RunRecord> {
    let mut run = RunRecord::new(system);

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| PipelineError::MalformedRunLine {
            path: path.to_path_buf(),
            line: idx + 1,
            reason,
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(malformed(format!("expected 6 fields, found {}", fields.len())));
        }

        let score: f64 = fields[4]
            .parse()
            .map_err(|e| malformed(format!("invalid score '{}': {}", fields[4], e)))?;
        if !score.is_finite() {
            return Err(malformed(format!("non-finite score '{}'", fields[4])));
        }

        run.insert(fields[0], fields[2], score);
    }

    Ok(run)
}

/// Loads per-system runs for one dataset
#[derive(Debug, Clone)]
pub struct RunLoader {
    trec_run_dir: PathBuf,
}

impl RunLoader {
    pub fn new(trec_run_dir: impl Into<PathBuf>) -> Self {
        Self {
            trec_run_dir: trec_run_dir.into(),
        }
    }

    pub fn path_for(&self, dataset: &str, model: &str) -> PathBuf {
        self.trec_run_dir
            .join(dataset)
            .join(format!("{}.trec", model))
    }

    pub fn load(&self, dataset: &str, model: &str) -> Result<RunRecord> {
        let path = self.path_for(dataset, model);
        if !path.is_file() {
            return Err(PipelineError::RunFileNotFound { path });
        }

        let run = parse_run(BufReader::new(File::open(&path)?), model, &path)?;
        tracing::debug!(
            "Loaded run {} for {}: {} queries",
            model,
            dataset,
            run.query_count()
        );
        Ok(run)
    }

    /// Load every model's run, failing on the first missing or malformed one
    pub fn load_all(&self, dataset: &str, models: &[String]) -> Result<Vec<RunRecord>> {
        models.iter().map(|model| self.load(dataset, model)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_run_last_duplicate_wins() {
        let input = "\
q1 Q0 d1 1 12.5 sys
q1 Q0 d2 2 11.0 sys

q2 Q0 d1 1 3 sys
q1 Q0 d1 3 9.0 sys
";
        let run = parse_run(input.as_bytes(), "sys", Path::new("run.trec")).unwrap();
        assert_eq!(run.query_count(), 2);
        assert_eq!(run.scores["q1"]["d1"], 9.0);
        assert_eq!(run.scores["q1"].len(), 2);
        assert_eq!(run.scores["q2"]["d1"], 3.0);
    }

    #[test]
    fn test_parse_run_rejects_short_line() {
        let input = "q1 Q0 d1 1 12.5 sys\nq1 d2 11.0\n";
        let err = parse_run(input.as_bytes(), "sys", Path::new("run.trec")).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRunLine { line: 2, .. }));
    }

    #[test]
    fn test_parse_run_rejects_bad_score() {
        let input = "q1 Q0 d1 1 high sys\n";
        let err = parse_run(input.as_bytes(), "sys", Path::new("run.trec")).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRunLine { line: 1, .. }));

        let input = "q1 Q0 d1 1 NaN sys\n";
        assert!(parse_run(input.as_bytes(), "sys", Path::new("run.trec")).is_err());
    }

    #[test]
    fn test_missing_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = RunLoader::new(dir.path());
        let err = loader.load("passage", "bge-small-en-v1.5").unwrap_err();
        match err {
            PipelineError::RunFileNotFound { path } => {
                assert_eq!(path, dir.path().join("passage/bge-small-en-v1.5.trec"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_all_stops_at_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("passage")).unwrap();
        fs::write(dir.path().join("passage/a.trec"), "q1 Q0 d1 1 1.0 a\n").unwrap();

        let loader = RunLoader::new(dir.path());
        let runs = loader.load_all("passage", &["a".to_string()]).unwrap();
        assert_eq!(runs[0].system, "a");

        let err = loader
            .load_all("passage", &["a".to_string(), "b".to_string()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::RunFileNotFound { .. }));
    }
}
