//! Pipeline orchestration
//!
//! Runs every configured unit of work (one indexing job, one dataset
//! report) to completion or failure. A failing unit is logged and recorded;
//! it never stops the units after it. The resulting [`RunSummary`] decides
//! the process exit code.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::DatasetCatalog;
use crate::config::{ExitPolicy, IndexingConfig, PipelineConfig};
use crate::encoders::EncoderProvider;
use crate::error::Result;
use crate::indexing::{
    CollectionIndexer, IndexJob, IndexSummary, TaskOutcome, TimeBoundedRunner, TimeBudget,
};
use crate::resource_monitor::ResourceMonitor;
use crate::significance::{
    ComparisonReport, ComparisonSettings, QrelsLoader, ReportWriter, RunLoader,
    SignificanceComparer,
};

/// How one unit of work ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "kebab-case")]
pub enum UnitStatus {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: UnitStatus,
    pub duration: Duration,
}

/// Outcomes of every unit in one invocation
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<UnitOutcome>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, unit: impl Into<String>, status: UnitStatus, duration: Duration) {
        self.outcomes.push(UnitOutcome {
            unit: unit.into(),
            status,
            duration,
        });
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Failed(_)))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::TimedOut))
    }

    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0 && self.timed_out() == 0
    }

    pub fn exit_code(&self, policy: ExitPolicy) -> i32 {
        match policy {
            ExitPolicy::AlwaysSucceed => 0,
            ExitPolicy::FailOnError if self.all_succeeded() => 0,
            ExitPolicy::FailOnError => 1,
        }
    }

    /// One line per unit, then totals
    pub fn format_table(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.unit.chars().count())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for o in &self.outcomes {
            let status = match &o.status {
                UnitStatus::Succeeded => "ok".to_string(),
                UnitStatus::TimedOut => "TIMED OUT".to_string(),
                UnitStatus::Failed(e) => format!("FAILED: {}", e),
            };
            out.push_str(&format!(
                "  {:<width$}  {:>8.1}s  {}\n",
                o.unit,
                o.duration.as_secs_f64(),
                status,
                width = width
            ));
        }
        out.push_str(&format!(
            "  {} succeeded, {} failed, {} timed out\n",
            self.succeeded(),
            self.failed(),
            self.timed_out()
        ));
        out
    }
}

/// Pipeline A over every configured job
pub struct IndexingPipeline {
    indexer: Arc<CollectionIndexer>,
    encoders: Arc<dyn EncoderProvider>,
    config: IndexingConfig,
}

impl IndexingPipeline {
    pub fn new(
        config: IndexingConfig,
        encoders: Arc<dyn EncoderProvider>,
        catalog: Arc<dyn DatasetCatalog>,
    ) -> Self {
        Self {
            indexer: Arc::new(CollectionIndexer::new(catalog)),
            encoders,
            config,
        }
    }

    /// Run all jobs under one shared wall-clock allocation
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::new();
        let started = Instant::now();

        for job_config in &self.config.jobs {
            let job = IndexJob::from_config(job_config, &self.config);
            let label = format!("index {}", job.label());

            let remaining = self.config.total_budget().saturating_sub(started.elapsed());
            let budget = TimeBudget::new(remaining, self.config.safety_margin());
            if budget.effective().is_zero() {
                tracing::error!("{}: no time left in the allocation, skipping", label);
                summary.record(label, UnitStatus::TimedOut, Duration::ZERO);
                continue;
            }

            let unit_start = Instant::now();
            let status = match self.run_job(job, budget).await {
                TaskOutcome::Completed(_) => UnitStatus::Succeeded,
                TaskOutcome::TimedOut { .. } => UnitStatus::TimedOut,
                TaskOutcome::Failed(e) => UnitStatus::Failed(format!("{:#}", e)),
            };
            summary.record(label, status, unit_start.elapsed());
        }

        summary
    }

    /// Load the encoders and index one dataset inside `budget`
    pub async fn run_job(
        &self,
        job: IndexJob,
        budget: TimeBudget,
    ) -> TaskOutcome<IndexSummary> {
        let indexer = Arc::clone(&self.indexer);
        let encoders = Arc::clone(&self.encoders);
        let label = job.label();

        TimeBoundedRunner::new(budget)
            .run(&label, move |cancel| async move {
                let mut monitor = ResourceMonitor::new();
                monitor.snapshot_baseline();

                let pair = encoders.build(&job.model_name, job.embedding_dim).await?;
                monitor.record_model_loaded(pair.load_duration());

                indexer.index(&job, &pair, monitor, &cancel).await
            })
            .await
    }
}

/// Pipeline B over every configured dataset
pub struct SignificancePipeline {
    runs: RunLoader,
    qrels: QrelsLoader,
    comparer: SignificanceComparer,
    writer: ReportWriter,
    models: Vec<String>,
    report_dir: PathBuf,
}

impl SignificancePipeline {
    pub fn from_config(config: &PipelineConfig, catalog: Arc<dyn DatasetCatalog>) -> Result<Self> {
        let sig = &config.significance;
        Ok(Self {
            runs: RunLoader::new(&sig.trec_run_dir),
            qrels: QrelsLoader::new(catalog, sig.qrels_rules.clone(), sig.qrels_fallback.clone()),
            comparer: SignificanceComparer::new(ComparisonSettings::from_config(sig)?),
            writer: ReportWriter::new(),
            models: sig.models.clone(),
            report_dir: sig.report_dir.clone(),
        })
    }

    /// Build and write the report of one dataset
    pub fn report(&self, dataset: &str) -> Result<ComparisonReport> {
        let qrels = self.qrels.load(dataset)?;
        let runs = self.runs.load_all(dataset, &self.models)?;
        let report = self.comparer.compare(dataset, &qrels, &runs)?;
        self.writer.write(&report, &self.report_dir.join(dataset))?;
        Ok(report)
    }

    pub fn run(&self, datasets: &[String]) -> RunSummary {
        let mut summary = RunSummary::new();

        for dataset in datasets {
            let label = format!("significance {}", dataset);
            let start = Instant::now();
            let status = match self.report(dataset) {
                Ok(report) => {
                    let significant = report.comparisons.iter().filter(|c| c.significant).count();
                    tracing::info!(
                        "{}: {} of {} comparisons significant",
                        label,
                        significant,
                        report.comparisons.len()
                    );
                    UnitStatus::Succeeded
                }
                Err(e) => {
                    tracing::error!("{} failed: {}", label, e);
                    UnitStatus::Failed(e.to_string())
                }
            };
            summary.record(label, status, start.elapsed());
        }

        summary
    }
}
