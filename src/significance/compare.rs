//! Pairwise significance testing between retrieval systems
//!
//! Per-query metric scores come from `elinor`; each unordered pair of
//! systems is compared with a two-tailed paired Student's t-test on those
//! scores.

use elinor::statistical_tests::{pairs_from_maps, StudentTTest};
use elinor::{Metric, PredRelStoreBuilder, TrueRelStoreBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::qrels::QrelsTable;
use super::runs::RunRecord;
use crate::config::{Correction, SignificanceConfig, TestKind};
use crate::error::{PipelineError, Result};

/// Differences closer than this are treated as equal
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-12;

/// Supported retrieval metric families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    ReciprocalRank,
    Ndcg,
    AveragePrecision,
    Precision,
    Recall,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReciprocalRank => "mrr",
            Self::Ndcg => "ndcg",
            Self::AveragePrecision => "map",
            Self::Precision => "precision",
            Self::Recall => "recall",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mrr" | "rr" => Some(Self::ReciprocalRank),
            "ndcg" => Some(Self::Ndcg),
            "map" | "ap" => Some(Self::AveragePrecision),
            "precision" | "p" => Some(Self::Precision),
            "recall" | "r" => Some(Self::Recall),
            _ => None,
        }
    }
}

/// A metric with its rank cutoff, written `name@k`
///
/// Without `@k` (or with `k = 0`) the whole ranking is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSpec {
    pub kind: MetricKind,
    pub k: usize,
}

impl MetricSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidConfig(format!("unknown metric '{}'", s));
        let (name, k) = match s.trim().split_once('@') {
            Some((name, k)) => (name, k.parse::<usize>().map_err(|_| invalid())?),
            None => (s.trim(), 0),
        };
        let kind = MetricKind::from_str(name).ok_or_else(invalid)?;
        Ok(Self { kind, k })
    }

    pub fn to_elinor(&self) -> Metric {
        let k = self.k;
        match self.kind {
            MetricKind::ReciprocalRank => Metric::RR { k },
            MetricKind::Ndcg => Metric::NDCG { k },
            MetricKind::AveragePrecision => Metric::AP { k },
            MetricKind::Precision => Metric::Precision { k },
            MetricKind::Recall => Metric::Recall { k },
        }
    }
}

impl fmt::Display for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.k == 0 {
            write!(f, "{}", self.kind.name())
        } else {
            write!(f, "{}@{}", self.kind.name(), self.k)
        }
    }
}

/// Knobs of one comparison
#[derive(Debug, Clone)]
pub struct ComparisonSettings {
    pub metrics: Vec<MetricSpec>,
    pub max_p: f64,
    pub test_kind: TestKind,
    pub correction: Correction,
    /// Evaluate on the queries shared by every run and the qrels instead of
    /// requiring identical query sets
    pub make_comparable: bool,
}

impl ComparisonSettings {
    pub fn from_config(config: &SignificanceConfig) -> Result<Self> {
        let metrics = config
            .metrics
            .iter()
            .map(|m| MetricSpec::parse(m))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            metrics,
            max_p: config.max_p,
            test_kind: config.stat_test,
            correction: config.correction,
            make_comparable: config.make_comparable,
        })
    }

    /// Per-pair threshold for `system_count` systems
    pub fn threshold(&self, system_count: usize) -> f64 {
        match self.correction {
            Correction::None => self.max_p,
            Correction::Bonferroni => {
                let pairs = system_count * system_count.saturating_sub(1) / 2;
                self.max_p / pairs.max(1) as f64
            }
        }
    }
}

/// Mean score of one system per metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemScores {
    pub system: String,
    pub means: BTreeMap<String, f64>,
}

/// Test result for one pair of systems on one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseComparison {
    pub system_a: String,
    pub system_b: String,
    pub metric: String,
    /// Mean of (a - b) over the evaluated queries
    pub mean_difference: f64,
    pub p_value: f64,
    /// Cohen's d of the paired differences; absent when they have no variance
    pub effect_size: Option<f64>,
    pub significant: bool,
}

impl PairwiseComparison {
    /// System that significantly outscored the other, if any
    pub fn winner(&self) -> Option<&str> {
        if !self.significant {
            None
        } else if self.mean_difference > 0.0 {
            Some(&self.system_a)
        } else if self.mean_difference < 0.0 {
            Some(&self.system_b)
        } else {
            None
        }
    }
}

/// Everything a report needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub dataset: String,
    pub metrics: Vec<String>,
    pub systems: Vec<String>,
    pub test: TestKind,
    pub max_p: f64,
    pub correction: Correction,
    pub threshold: f64,
    pub query_count: usize,
    pub scores: Vec<SystemScores>,
    pub comparisons: Vec<PairwiseComparison>,
}

impl ComparisonReport {
    pub fn mean(&self, system: &str, metric: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.system == system)
            .and_then(|s| s.means.get(metric).copied())
    }
}

/// Query ids the comparison is evaluated on
///
/// With `make_comparable` this is the intersection of the qrels queries and
/// every run's queries. Without it every run must cover exactly the qrels
/// queries.
pub fn query_universe(
    qrels: &QrelsTable,
    runs: &[RunRecord],
    make_comparable: bool,
) -> Result<BTreeSet<String>> {
    let judged = qrels.query_ids();

    if make_comparable {
        let mut universe = judged;
        for run in runs {
            let covered = run.query_ids();
            universe.retain(|q| covered.contains(q));
        }
        return Ok(universe.into_iter().map(str::to_string).collect());
    }

    for run in runs {
        let covered = run.query_ids();
        let missing = judged.difference(&covered).count();
        let extra = covered.difference(&judged).count();
        if missing > 0 || extra > 0 {
            return Err(PipelineError::NotComparable {
                system: run.system.clone(),
                missing,
                extra,
            });
        }
    }
    Ok(judged.into_iter().map(str::to_string).collect())
}

/// Runs the pairwise tests
#[derive(Debug, Clone)]
pub struct SignificanceComparer {
    settings: ComparisonSettings,
}

impl SignificanceComparer {
    pub fn new(settings: ComparisonSettings) -> Self {
        Self { settings }
    }

    pub fn compare(
        &self,
        dataset: &str,
        qrels: &QrelsTable,
        runs: &[RunRecord],
    ) -> Result<ComparisonReport> {
        if runs.len() < 2 {
            return Err(PipelineError::Comparison(format!(
                "{}: need at least 2 systems, got {}",
                dataset,
                runs.len()
            )));
        }
        if self.settings.metrics.is_empty() {
            return Err(PipelineError::Comparison(format!("{}: no metrics configured", dataset)));
        }

        let universe = query_universe(qrels, runs, self.settings.make_comparable)?;
        if universe.len() < 2 {
            return Err(PipelineError::Comparison(format!(
                "{}: {} common queries between runs and qrels, need at least 2",
                dataset,
                universe.len()
            )));
        }
        if self.settings.make_comparable && universe.len() < qrels.query_count() {
            tracing::warn!(
                "{}: evaluating on {} of {} judged queries shared by all runs",
                dataset,
                universe.len(),
                qrels.query_count()
            );
        }

        let true_rels = build_true_rels(qrels, &universe)?;
        let pred_rels = runs
            .iter()
            .map(|run| build_pred_rels(run, &universe))
            .collect::<Result<Vec<_>>>()?;

        let threshold = self.settings.threshold(runs.len());
        let metric_names: Vec<String> = self.settings.metrics.iter().map(|m| m.to_string()).collect();
        let mut scores: Vec<SystemScores> = runs
            .iter()
            .map(|run| SystemScores {
                system: run.system.clone(),
                means: BTreeMap::new(),
            })
            .collect();
        let mut comparisons = Vec::new();

        for (metric, metric_name) in self.settings.metrics.iter().zip(&metric_names) {
            let mut per_query = Vec::with_capacity(runs.len());
            for (run, pred) in runs.iter().zip(&pred_rels) {
                let evaluation = elinor::evaluate(&true_rels, pred, metric.to_elinor())
                    .map_err(|e| PipelineError::Statistics(format!("{} on {}: {}", metric_name, run.system, e)))?;
                per_query.push((evaluation.mean(), evaluation.scores().clone()));
            }

            for (system, (mean, _)) in scores.iter_mut().zip(&per_query) {
                system.means.insert(metric_name.clone(), *mean);
            }

            for i in 0..runs.len() {
                for j in (i + 1)..runs.len() {
                    let (p_value, effect_size, mean_difference) =
                        paired_test(&per_query[i].1, &per_query[j].1)?;
                    comparisons.push(PairwiseComparison {
                        system_a: runs[i].system.clone(),
                        system_b: runs[j].system.clone(),
                        metric: metric_name.clone(),
                        mean_difference,
                        p_value,
                        effect_size,
                        significant: p_value < threshold,
                    });
                }
            }
        }

        tracing::info!(
            "{}: compared {} systems on {} queries ({} tests, threshold {:.4})",
            dataset,
            runs.len(),
            universe.len(),
            comparisons.len(),
            threshold
        );

        Ok(ComparisonReport {
            dataset: dataset.to_string(),
            metrics: metric_names,
            systems: runs.iter().map(|r| r.system.clone()).collect(),
            test: self.settings.test_kind,
            max_p: self.settings.max_p,
            correction: self.settings.correction,
            threshold,
            query_count: universe.len(),
            scores,
            comparisons,
        })
    }
}

fn build_true_rels(
    qrels: &QrelsTable,
    universe: &BTreeSet<String>,
) -> Result<elinor::TrueRelStore<String>> {
    let mut builder = TrueRelStoreBuilder::new();
    for query_id in universe {
        if let Some(labels) = qrels.judgments.get(query_id) {
            for (doc_id, &label) in labels {
                builder
                    .add_record(query_id.clone(), doc_id.clone(), label.max(0) as u32)
                    .map_err(|e| PipelineError::Statistics(e.to_string()))?;
            }
        }
    }
    Ok(builder.build())
}

fn build_pred_rels(
    run: &RunRecord,
    universe: &BTreeSet<String>,
) -> Result<elinor::PredRelStore<String>> {
    let mut builder = PredRelStoreBuilder::new();
    for query_id in universe {
        if let Some(docs) = run.scores.get(query_id) {
            for (doc_id, &score) in docs {
                builder
                    .add_record(query_id.clone(), doc_id.clone(), score.into())
                    .map_err(|e| PipelineError::Statistics(format!("{}: {}", run.system, e)))?;
            }
        }
    }
    Ok(builder.build())
}

/// Paired two-tailed t-test of `a` against `b`
///
/// Returns (p-value, effect size, mean difference). Constant differences
/// have no variance and are decided directly: identical scores give p = 1,
/// a constant non-zero shift gives p = 0.
fn paired_test(
    a: &BTreeMap<String, f64>,
    b: &BTreeMap<String, f64>,
) -> Result<(f64, Option<f64>, f64)> {
    let pairs = pairs_from_maps(a, b).map_err(|e| PipelineError::Statistics(e.to_string()))?;
    if pairs.is_empty() {
        return Err(PipelineError::Statistics("no paired samples".to_string()));
    }

    let diffs: Vec<f64> = pairs.iter().map(|(x, y)| x - y).collect();
    let mean_difference = diffs.iter().sum::<f64>() / diffs.len() as f64;

    if diffs
        .iter()
        .all(|d| (d - diffs[0]).abs() <= ZERO_VARIANCE_TOLERANCE)
    {
        let p_value = if mean_difference.abs() <= ZERO_VARIANCE_TOLERANCE {
            1.0
        } else {
            0.0
        };
        return Ok((p_value, None, mean_difference));
    }

    let stat = StudentTTest::from_paired_samples(pairs.iter().copied())
        .map_err(|e| PipelineError::Statistics(e.to_string()))?;
    Ok((stat.p_value(), Some(stat.effect_size()), mean_difference))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn qrels(entries: &[(&str, &str, i32)]) -> QrelsTable {
        QrelsTable::from_records(entries.iter().map(|(q, d, l)| crate::catalog::QrelRecord {
            query_id: q.to_string(),
            doc_id: d.to_string(),
            label: *l,
        }))
    }

    pub(crate) fn run(system: &str, entries: &[(&str, &str, f64)]) -> RunRecord {
        let mut run = RunRecord::new(system);
        for (q, d, s) in entries {
            run.insert(q, d, *s);
        }
        run
    }

    pub(crate) fn settings(make_comparable: bool) -> ComparisonSettings {
        ComparisonSettings {
            metrics: vec![MetricSpec::parse("mrr@10").unwrap(), MetricSpec::parse("ndcg@10").unwrap()],
            max_p: 0.05,
            test_kind: TestKind::Student,
            correction: Correction::None,
            make_comparable,
        }
    }

    /// Four judged queries, each with one relevant document `rel`
    pub(crate) fn sample_qrels() -> QrelsTable {
        qrels(&[
            ("q1", "rel", 1),
            ("q2", "rel", 1),
            ("q3", "rel", 1),
            ("q4", "rel", 1),
            ("q4", "other", 0),
        ])
    }

    /// System `good` ranks the relevant document first, `bad` second or lower
    pub(crate) fn sample_runs() -> Vec<RunRecord> {
        let good = run(
            "good",
            &[
                ("q1", "rel", 2.0), ("q1", "x", 1.0),
                ("q2", "rel", 2.0), ("q2", "x", 1.0),
                ("q3", "rel", 2.0), ("q3", "x", 1.0),
                ("q4", "rel", 2.0), ("q4", "x", 1.0),
            ],
        );
        let bad = run(
            "bad",
            &[
                ("q1", "rel", 1.0), ("q1", "x", 2.0),
                ("q2", "rel", 1.0), ("q2", "x", 2.0), ("q2", "y", 3.0),
                ("q3", "rel", 2.0), ("q3", "x", 1.0),
                ("q4", "rel", 1.0), ("q4", "x", 2.0),
            ],
        );
        vec![good, bad]
    }

    #[test]
    fn test_metric_spec_parse() {
        let spec = MetricSpec::parse("MRR@10").unwrap();
        assert_eq!(spec.kind, MetricKind::ReciprocalRank);
        assert_eq!(spec.k, 10);
        assert_eq!(spec.to_string(), "mrr@10");
        assert_eq!(MetricSpec::parse("ap").unwrap().to_string(), "map");
        assert_eq!(MetricSpec::parse("p@5").unwrap().kind, MetricKind::Precision);
        assert!(MetricSpec::parse("bleu@4").is_err());
        assert!(MetricSpec::parse("ndcg@ten").is_err());
    }

    #[test]
    fn test_bonferroni_threshold() {
        let mut s = settings(true);
        assert_eq!(s.threshold(10), 0.05);
        s.correction = Correction::Bonferroni;
        assert!((s.threshold(10) - 0.05 / 45.0).abs() < 1e-15);
        assert_eq!(s.threshold(2), 0.05);
    }

    #[test]
    fn test_compare_two_systems() {
        let report = SignificanceComparer::new(settings(true))
            .compare("toy", &sample_qrels(), &sample_runs())
            .unwrap();

        assert_eq!(report.query_count, 4);
        assert_eq!(report.systems, vec!["good", "bad"]);
        assert_eq!(report.metrics, vec!["mrr@10", "ndcg@10"]);
        assert_eq!(report.comparisons.len(), 2);
        assert!((report.mean("good", "mrr@10").unwrap() - 1.0).abs() < 1e-12);
        // bad: 1/2, 1/3, 1, 1/2
        let expected_bad = (0.5 + 1.0 / 3.0 + 1.0 + 0.5) / 4.0;
        assert!((report.mean("bad", "mrr@10").unwrap() - expected_bad).abs() < 1e-12);

        let mrr = &report.comparisons[0];
        assert_eq!(mrr.metric, "mrr@10");
        assert!(mrr.mean_difference > 0.0);
        assert!(mrr.p_value > 0.0 && mrr.p_value <= 1.0);
        assert!(mrr.effect_size.is_some());
    }

    #[test]
    fn test_identical_runs_are_not_significant() {
        let runs = vec![sample_runs()[0].clone(), {
            let mut copy = sample_runs()[0].clone();
            copy.system = "copy".to_string();
            copy
        }];
        let report = SignificanceComparer::new(settings(true))
            .compare("toy", &sample_qrels(), &runs)
            .unwrap();
        for c in &report.comparisons {
            assert_eq!(c.p_value, 1.0);
            assert_eq!(c.effect_size, None);
            assert!(!c.significant);
            assert_eq!(c.winner(), None);
        }
    }

    #[test]
    fn test_make_comparable_ignores_extra_queries() {
        let mut superset = sample_runs();
        superset[0].insert("q9", "rel", 5.0);
        superset[1].insert("q_extra", "d", 1.0);

        let comparer = SignificanceComparer::new(settings(true));
        let filtered = comparer.compare("toy", &sample_qrels(), &sample_runs()).unwrap();
        let widened = comparer.compare("toy", &sample_qrels(), &superset).unwrap();

        assert_eq!(filtered.scores, widened.scores);
        assert_eq!(filtered.comparisons, widened.comparisons);
        assert_eq!(widened.query_count, 4);
    }

    #[test]
    fn test_make_comparable_intersects_missing_queries() {
        let mut runs = sample_runs();
        runs[1].scores.remove("q1");

        let report = SignificanceComparer::new(settings(true))
            .compare("toy", &sample_qrels(), &runs)
            .unwrap();
        assert_eq!(report.query_count, 3);
    }

    #[test]
    fn test_not_comparable_without_flag() {
        let mut runs = sample_runs();
        runs[1].scores.remove("q1");
        runs[1].insert("q7", "d", 1.0);

        let err = SignificanceComparer::new(settings(false))
            .compare("toy", &sample_qrels(), &runs)
            .unwrap_err();
        match err {
            PipelineError::NotComparable { system, missing, extra } => {
                assert_eq!(system, "bad");
                assert_eq!(missing, 1);
                assert_eq!(extra, 1);
            }
            other => panic!("unexpected error: {}", other),
        }

        // Matching query sets pass
        assert!(SignificanceComparer::new(settings(false))
            .compare("toy", &sample_qrels(), &sample_runs())
            .is_ok());
    }

    #[test]
    fn test_needs_two_systems_and_queries() {
        let comparer = SignificanceComparer::new(settings(true));
        let one = vec![sample_runs()[0].clone()];
        assert!(matches!(
            comparer.compare("toy", &sample_qrels(), &one),
            Err(PipelineError::Comparison(_))
        ));

        let tiny = qrels(&[("q1", "rel", 1)]);
        assert!(matches!(
            comparer.compare("toy", &tiny, &sample_runs()),
            Err(PipelineError::Comparison(_))
        ));
    }

    #[test]
    fn test_constant_shift_is_significant() {
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        for (i, q) in ["q1", "q2", "q3"].iter().enumerate() {
            a.insert(q.to_string(), 0.5 + i as f64 * 0.1);
            b.insert(q.to_string(), 0.25 + i as f64 * 0.1);
        }
        let (p, effect, diff) = paired_test(&a, &b).unwrap();
        assert_eq!(p, 0.0);
        assert_eq!(effect, None);
        assert!((diff - 0.25).abs() < 1e-12);
    }
}
