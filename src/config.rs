//! Configuration for both pipelines
//!
//! Every section has defaults for the MS MARCO passage setup, so an empty
//! file (or no file at all) is a valid configuration.
//!
//! ```toml
//! catalog_dir = "data"
//! exit_policy = "always-succeed"
//!
//! [indexing]
//! index_dir = "snowflake"
//!
//! [[indexing.jobs]]
//! dataset = "irds:msmarco-passage"
//! model = "snowflake-arctic-embed-xs"
//! embedding_dim = 384
//! max_id_length = 7
//!
//! [significance]
//! datasets = ["passage"]
//! models = ["bge-small-en-v1.5", "e5-small-v2"]
//! metrics = ["mrr@10", "ndcg@10"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::significance::MetricSpec;

/// How multi-passage documents are collapsed into one document score
///
/// Stored in the index manifest and handed to the retrieval side; indexing
/// itself never aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Every passage is scored on its own
    Passage,
    /// Maximum passage score per document
    #[default]
    MaxP,
    /// Score of the first passage
    FirstP,
    /// Mean passage score
    AvgP,
}

impl AggregationMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Passage => "passage",
            Self::MaxP => "maxp",
            Self::FirstP => "firstp",
            Self::AvgP => "avgp",
        }
    }
}

/// Process exit behaviour once every unit of work has run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Always exit 0; failures are only logged
    #[default]
    AlwaysSucceed,
    /// Exit 1 when any unit failed or timed out
    FailOnError,
}

/// Paired significance test family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Two-tailed paired Student's t-test
    #[default]
    Student,
}

impl TestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Student => "student",
        }
    }
}

/// Multiple-comparison correction applied to `max_p`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Correction {
    /// `max_p` is a per-comparison threshold
    #[default]
    None,
    /// `max_p` is family-wise; divided by the number of pairs per metric
    Bonferroni,
}

impl Correction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bonferroni => "bonferroni",
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the local dataset catalog
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,

    #[serde(default)]
    pub exit_policy: ExitPolicy,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub significance: SignificanceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalog_dir: default_catalog_dir(),
            exit_policy: ExitPolicy::default(),
            indexing: IndexingConfig::default(),
            significance: SignificanceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load config from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid pipeline config: {:?}", path))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise return defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::info!("No config at {:?}, using built-in defaults", path);
        Ok(Self::default())
    }

    /// Save config to TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no pipeline could run with
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let idx = &self.indexing;
        if idx.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "indexing.batch_size must be at least 1".to_string(),
            ));
        }
        if idx.timeout_secs <= idx.safety_margin_secs {
            return Err(PipelineError::InvalidConfig(format!(
                "indexing.timeout_secs ({}) must exceed safety_margin_secs ({})",
                idx.timeout_secs, idx.safety_margin_secs
            )));
        }
        for job in &idx.jobs {
            if job.max_id_length == 0 || job.embedding_dim == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "job {} / {}: max_id_length and embedding_dim must be positive",
                    job.dataset, job.model
                )));
            }
        }

        let sig = &self.significance;
        if !(sig.max_p > 0.0 && sig.max_p < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "significance.max_p must be in (0, 1), got {}",
                sig.max_p
            )));
        }
        if sig.metrics.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "significance.metrics must not be empty".to_string(),
            ));
        }
        for metric in &sig.metrics {
            MetricSpec::parse(metric)?;
        }
        if !sig.qrels_fallback.contains("{dataset}") {
            return Err(PipelineError::InvalidConfig(
                "significance.qrels_fallback must contain a {dataset} placeholder".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pipeline A settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Directory that receives the index artifacts
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Encoder batch size (throughput only, never changes vectors)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub aggregation_mode: AggregationMode,

    /// Wall-clock budget granted by the job scheduler
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Time kept back for scheduler cleanup before the hard kill
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,

    #[serde(default = "default_jobs")]
    pub jobs: Vec<IndexJobConfig>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            batch_size: default_batch_size(),
            aggregation_mode: AggregationMode::default(),
            timeout_secs: default_timeout_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            jobs: default_jobs(),
        }
    }
}

impl IndexingConfig {
    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }
}

/// One (dataset, model) indexing job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJobConfig {
    pub dataset: String,
    pub model: String,
    pub embedding_dim: usize,
    pub max_id_length: usize,
}

/// Dataset-specific qrels resolution and label normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrelsRule {
    /// Report dataset name this rule applies to
    pub dataset: String,
    /// Catalog id holding the judgments
    pub source: String,
    /// Labels below this value are clamped to 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_relevant_label: Option<i32>,
}

/// Pipeline B settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceConfig {
    #[serde(default = "default_report_datasets")]
    pub datasets: Vec<String>,

    #[serde(default = "default_report_models")]
    pub models: Vec<String>,

    /// Holds `<dataset>/<model>.trec`
    #[serde(default = "default_trec_run_dir")]
    pub trec_run_dir: PathBuf,

    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    #[serde(default = "default_max_p")]
    pub max_p: f64,

    #[serde(default)]
    pub stat_test: TestKind,

    #[serde(default)]
    pub correction: Correction,

    #[serde(default = "default_make_comparable")]
    pub make_comparable: bool,

    /// Catalog id template for datasets without a rule
    #[serde(default = "default_qrels_fallback")]
    pub qrels_fallback: String,

    #[serde(default = "default_qrels_rules")]
    pub qrels_rules: Vec<QrelsRule>,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            datasets: default_report_datasets(),
            models: default_report_models(),
            trec_run_dir: default_trec_run_dir(),
            report_dir: default_report_dir(),
            metrics: default_metrics(),
            max_p: default_max_p(),
            stat_test: TestKind::default(),
            correction: Correction::default(),
            make_comparable: default_make_comparable(),
            qrels_fallback: default_qrels_fallback(),
            qrels_rules: default_qrels_rules(),
        }
    }
}

fn default_catalog_dir() -> PathBuf { PathBuf::from("data") }
fn default_index_dir() -> PathBuf { PathBuf::from("snowflake") }
fn default_batch_size() -> usize { 8 }
fn default_timeout_secs() -> u64 { 9 * 3600 }
fn default_safety_margin_secs() -> u64 { 120 }
fn default_trec_run_dir() -> PathBuf { PathBuf::from("results/trec_runs") }
fn default_report_dir() -> PathBuf { PathBuf::from("results/significance_reports") }
fn default_max_p() -> f64 { 0.05 }
fn default_make_comparable() -> bool { true }
fn default_qrels_fallback() -> String { "irds:beir/{dataset}/test".to_string() }

fn default_jobs() -> Vec<IndexJobConfig> {
    vec![IndexJobConfig {
        dataset: "irds:msmarco-passage".to_string(),
        model: "snowflake-arctic-embed-xs".to_string(),
        embedding_dim: 384,
        max_id_length: 7,
    }]
}

fn default_report_datasets() -> Vec<String> {
    vec!["passage".to_string()]
}

fn default_report_models() -> Vec<String> {
    [
        "tct_colbert_msmarco",
        "gte-base-en-v1.5",
        "bge-base-en-v1.5",
        "snowflake-arctic-embed-m",
        "e5-base-v2",
        "e5-base-unsupervised",
        "nomic-embed-text-v1",
        "bge-small-en-v1.5",
        "snowflake-arctic-embed-xs",
        "e5-small-v2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_metrics() -> Vec<String> {
    vec!["mrr@10".to_string(), "ndcg@10".to_string()]
}

fn default_qrels_rules() -> Vec<QrelsRule> {
    // TREC DL judges 0-1 as non-relevant on its 0-3 scale
    vec![QrelsRule {
        dataset: "passage".to_string(),
        source: "irds:msmarco-passage/trec-dl-2019".to_string(),
        min_relevant_label: Some(2),
    }]
}
