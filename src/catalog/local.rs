//! Directory-backed catalog in BEIR layout
//!
//! ```text
//! <root>/beir/scifact/corpus.jsonl      {"_id": "d1", "title": "...", "text": "..."}
//! <root>/beir/scifact/queries.jsonl     {"_id": "q1", "text": "..."}
//! <root>/beir/scifact/qrels/test.tsv    query-id  corpus-id  score
//! ```
//!
//! A dataset id maps to a directory; files missing there are looked up in the
//! parent directories, so `irds:beir/scifact/test` shares the corpus of
//! `beir/scifact` and finds its judgments in `beir/scifact/qrels/test.tsv`.
//! Qrels may also be in TREC format (`qid iter docid label`).

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{DatasetCatalog, DatasetId, Document, DocumentStream, QrelRecord, Query, QueryStream};
use crate::error::{PipelineError, Result};

const CORPUS_FILE: &str = "corpus.jsonl";
const QUERIES_FILE: &str = "queries.jsonl";

#[derive(Debug, Deserialize)]
struct BeirDocument {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    #[serde(default)]
    title: String,
    text: String,
}

impl From<BeirDocument> for Document {
    fn from(doc: BeirDocument) -> Self {
        let text = if doc.title.trim().is_empty() {
            doc.text
        } else {
            format!("{} {}", doc.title, doc.text)
        };
        Document { id: doc.id, text }
    }
}

#[derive(Debug, Deserialize)]
struct BeirQuery {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    text: String,
}

impl From<BeirQuery> for Query {
    fn from(query: BeirQuery) -> Self {
        Query {
            id: query.id,
            text: query.text,
        }
    }
}

/// Catalog rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    root: PathBuf,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the first existing candidate, walking from the dataset directory
    /// up to (but not above) the catalog root
    fn locate(&self, dataset: &DatasetId, candidates: &[String]) -> Result<PathBuf> {
        let relative = dataset.relative_path()?;
        let mut dir = self.root.join(&relative);

        loop {
            for candidate in candidates {
                let path = dir.join(candidate);
                if path.is_file() {
                    return Ok(path);
                }
            }
            if dir == self.root || !dir.pop() || !dir.starts_with(&self.root) {
                break;
            }
        }

        Err(PipelineError::DatasetNotFound {
            dataset: dataset.to_string(),
            path: self.root.join(relative).join(&candidates[0]),
        })
    }

    fn qrels_candidates(dataset: &DatasetId) -> Result<Vec<String>> {
        let relative = dataset.relative_path()?;
        let mut candidates = vec![
            "qrels.tsv".to_string(),
            "qrels.txt".to_string(),
            "qrels/test.tsv".to_string(),
        ];
        if let Some(split) = relative.file_name().and_then(|n| n.to_str()) {
            candidates.push(format!("qrels/{}.tsv", split));
            candidates.push(format!("qrels/{}.txt", split));
        }
        Ok(candidates)
    }
}

impl DatasetCatalog for LocalCatalog {
    fn documents(&self, dataset: &DatasetId) -> Result<DocumentStream> {
        let path = self.locate(dataset, &[CORPUS_FILE.to_string()])?;
        tracing::debug!("Streaming documents of {} from {:?}", dataset, path);
        read_jsonl::<BeirDocument, Document>(path)
    }

    fn queries(&self, dataset: &DatasetId) -> Result<QueryStream> {
        let path = self.locate(dataset, &[QUERIES_FILE.to_string()])?;
        tracing::debug!("Streaming queries of {} from {:?}", dataset, path);
        read_jsonl::<BeirQuery, Query>(path)
    }

    fn qrels(&self, dataset: &DatasetId) -> Result<Vec<QrelRecord>> {
        let path = self.locate(dataset, &Self::qrels_candidates(dataset)?)?;
        tracing::debug!("Reading qrels of {} from {:?}", dataset, path);
        let file = File::open(&path)?;
        parse_qrels(BufReader::new(file), &path)
    }
}

/// Lazily decode one JSON object per line, skipping blank lines
fn read_jsonl<T, U>(path: PathBuf) -> Result<Box<dyn Iterator<Item = Result<U>> + Send>>
where
    T: DeserializeOwned + Into<U>,
    U: 'static,
{
    let reader = BufReader::new(File::open(&path)?);
    let iter = reader
        .lines()
        .enumerate()
        .filter_map(move |(idx, line)| match line {
            Err(e) => Some(Err(PipelineError::from(e))),
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str::<T>(&line)
                    .map(Into::into)
                    .map_err(|e| PipelineError::MalformedDatasetRecord {
                        path: path.clone(),
                        line: idx + 1,
                        reason: e.to_string(),
                    }),
            ),
        });
    Ok(Box::new(iter))
}

/// Parse BEIR TSV (`qid docid label`) or TREC (`qid iter docid label`) qrels
///
/// A first line whose label column is not an integer is treated as a header.
pub(crate) fn parse_qrels<R: BufRead>(reader: R, path: &Path) -> Result<Vec<QrelRecord>> {
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let (query_id, doc_id, label) = match fields.as_slice() {
            [q, d, l] => (*q, *d, *l),
            [q, _, d, l] => (*q, *d, *l),
            _ => {
                return Err(PipelineError::MalformedQrelsLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: format!("expected 3 or 4 fields, found {}", fields.len()),
                })
            }
        };

        let label = match label.parse::<i32>() {
            Ok(label) => label,
            Err(_) if idx == 0 => continue,
            Err(e) => {
                return Err(PipelineError::MalformedQrelsLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: format!("invalid label '{}': {}", label, e),
                })
            }
        };

        records.push(QrelRecord {
            query_id: query_id.to_string(),
            doc_id: doc_id.to_string(),
            label,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_documents_and_queries_stream() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("beir/scifact/corpus.jsonl"),
            "{\"_id\": \"d1\", \"title\": \"Title\", \"text\": \"body one\"}\n\n{\"_id\": \"d2\", \"text\": \"body two\"}\n",
        );
        write(
            &root.join("beir/scifact/queries.jsonl"),
            "{\"_id\": \"q1\", \"text\": \"what\"}\n",
        );

        let catalog = LocalCatalog::new(root);
        let id = DatasetId::new("irds:beir/scifact/test");

        let docs: Vec<Document> = catalog
            .documents(&id)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "Title body one");
        assert_eq!(docs[1].id, "d2");
        assert_eq!(docs[1].text, "body two");

        let queries: Vec<Query> = catalog.queries(&id).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(queries, vec![Query { id: "q1".into(), text: "what".into() }]);
    }

    #[test]
    fn test_malformed_record_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("toy/corpus.jsonl"),
            "{\"_id\": \"d1\", \"text\": \"ok\"}\nnot json\n",
        );
        let catalog = LocalCatalog::new(dir.path());
        let results: Vec<_> = catalog.documents(&DatasetId::new("toy")).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(PipelineError::MalformedDatasetRecord { line: 2, .. })
        ));
    }

    #[test]
    fn test_missing_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = LocalCatalog::new(dir.path());
        let err = catalog.documents(&DatasetId::new("nope")).err().unwrap();
        assert!(matches!(err, PipelineError::DatasetNotFound { .. }));
    }

    #[test]
    fn test_qrels_split_lookup_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("msmarco-passage/qrels/trec-dl-2019.tsv"),
            "19335 Q0 1017759 0\n19335 Q0 1082489 3\n",
        );
        write(
            &root.join("beir/scifact/qrels/test.tsv"),
            "query-id\tcorpus-id\tscore\n1\t31715818\t1\n",
        );

        let catalog = LocalCatalog::new(root);
        let trec = catalog
            .qrels(&DatasetId::new("irds:msmarco-passage/trec-dl-2019"))
            .unwrap();
        assert_eq!(trec.len(), 2);
        assert_eq!(trec[1].doc_id, "1082489");
        assert_eq!(trec[1].label, 3);

        let beir = catalog.qrels(&DatasetId::new("irds:beir/scifact/test")).unwrap();
        assert_eq!(
            beir,
            vec![QrelRecord {
                query_id: "1".into(),
                doc_id: "31715818".into(),
                label: 1
            }]
        );
    }

    #[test]
    fn test_parse_qrels_rejects_bad_label() {
        let input = "q1 d1 1\nq1 d2 high\n";
        let err = parse_qrels(input.as_bytes(), Path::new("x.tsv")).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedQrelsLine { line: 2, .. }));
    }
}
