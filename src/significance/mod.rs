//! Pipeline B: statistical significance reports over TREC runs
//!
//! [`RunLoader`] and [`QrelsLoader`] read the inputs, the
//! [`SignificanceComparer`] runs paired t-tests between every pair of
//! systems, and the [`ReportWriter`] renders the result as text and JSON.

pub mod compare;
pub mod qrels;
pub mod report;
pub mod runs;

pub use compare::{
    query_universe, ComparisonReport, ComparisonSettings, MetricKind, MetricSpec,
    PairwiseComparison, SignificanceComparer, SystemScores,
};
pub use qrels::{QrelsLoader, QrelsSource, QrelsTable};
pub use report::ReportWriter;
pub use runs::{parse_run, RunLoader, RunRecord};
