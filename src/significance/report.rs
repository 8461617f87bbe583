//! Report rendering
//!
//! Text layout follows the usual IR paper table: each system gets a letter,
//! and a mean is followed by the superscript letters of every system it
//! significantly outperforms on that metric.
//!
//! ```text
//! #  Model                 mrr@10     ndcg@10
//! -  --------------------  ---------  ---------
//! a  bge-base-en-v1.5      0.3612ᵇ    0.4410ᵇ
//! b  bge-small-en-v1.5     0.3401     0.4198
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::compare::ComparisonReport;
use crate::error::Result;

const SUPERSCRIPTS: [char; 26] = [
    'ᵃ', 'ᵇ', 'ᶜ', 'ᵈ', 'ᵉ', 'ᶠ', 'ᵍ', 'ʰ', 'ⁱ', 'ʲ', 'ᵏ', 'ˡ', 'ᵐ', 'ⁿ', 'ᵒ', 'ᵖ', 'ᑫ', 'ʳ', 'ˢ',
    'ᵗ', 'ᵘ', 'ᵛ', 'ʷ', 'ˣ', 'ʸ', 'ᶻ',
];

/// Short label of the system at `index`: a..z, then a26, a27, ...
fn system_label(index: usize) -> String {
    if index < 26 {
        ((b'a' + index as u8) as char).to_string()
    } else {
        format!("a{}", index)
    }
}

fn superscript(index: usize) -> String {
    match SUPERSCRIPTS.get(index) {
        Some(c) => c.to_string(),
        None => format!("^{}", system_label(index)),
    }
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    format!("{}{}", text, " ".repeat(width.saturating_sub(len)))
}

/// Writes `<base>.txt` and `<base>.json`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportWriter;

impl ReportWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write both renderings next to each other, creating parent directories
    pub fn write(&self, report: &ComparisonReport, base: &Path) -> Result<(PathBuf, PathBuf)> {
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)?;
        }

        let text_path = with_suffix(base, ".txt");
        let json_path = with_suffix(base, ".json");
        fs::write(&text_path, self.render_text(report))?;
        fs::write(&json_path, self.render_json(report)?)?;

        tracing::info!("Report written to {:?} and {:?}", text_path, json_path);
        Ok((text_path, json_path))
    }

    pub fn render_json(&self, report: &ComparisonReport) -> Result<String> {
        let mut json = serde_json::to_string_pretty(report)?;
        json.push('\n');
        Ok(json)
    }

    pub fn render_text(&self, report: &ComparisonReport) -> String {
        let mut out = String::new();

        out.push_str(&format!("Significance report: {}\n", report.dataset));
        out.push_str(&format!(
            "Test: paired {} t-test, max_p {} ({} correction, threshold {:.6}), {} queries\n\n",
            report.test.name(),
            report.max_p,
            report.correction.name(),
            report.threshold,
            report.query_count
        ));

        let index_of = |system: &str| report.systems.iter().position(|s| s == system);

        // cells[row][col]
        let cells: Vec<Vec<String>> = report
            .systems
            .iter()
            .map(|system| {
                report
                    .metrics
                    .iter()
                    .map(|metric| {
                        let mut cell = match report.mean(system, metric) {
                            Some(mean) => format!("{:.4}", mean),
                            None => "-".to_string(),
                        };
                        let mut beaten: Vec<usize> = report
                            .comparisons
                            .iter()
                            .filter(|c| &c.metric == metric && c.winner() == Some(system.as_str()))
                            .filter_map(|c| {
                                let loser = if c.system_a == *system { &c.system_b } else { &c.system_a };
                                index_of(loser)
                            })
                            .collect();
                        beaten.sort_unstable();
                        for idx in beaten {
                            cell.push_str(&superscript(idx));
                        }
                        cell
                    })
                    .collect()
            })
            .collect();

        let label_width = system_label(report.systems.len().saturating_sub(1)).len().max(1);
        let name_width = report
            .systems
            .iter()
            .map(|s| s.chars().count())
            .chain(std::iter::once("Model".len()))
            .max()
            .unwrap_or(5);
        let col_widths: Vec<usize> = report
            .metrics
            .iter()
            .enumerate()
            .map(|(col, metric)| {
                cells
                    .iter()
                    .map(|row| row[col].chars().count())
                    .chain(std::iter::once(metric.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut header = format!("{}  {}", pad("#", label_width), pad("Model", name_width));
        let mut rule = format!("{}  {}", "-".repeat(label_width), "-".repeat(name_width));
        for (metric, width) in report.metrics.iter().zip(&col_widths) {
            header.push_str(&format!("  {}", pad(metric, *width)));
            rule.push_str(&format!("  {}", "-".repeat(*width)));
        }
        out.push_str(header.trim_end());
        out.push('\n');
        out.push_str(&rule);
        out.push('\n');

        for (row, system) in report.systems.iter().enumerate() {
            let mut line = format!("{}  {}", pad(&system_label(row), label_width), pad(system, name_width));
            for (cell, width) in cells[row].iter().zip(&col_widths) {
                line.push_str(&format!("  {}", pad(cell, *width)));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }

        out.push_str("\nPairwise comparisons\n");
        for c in &report.comparisons {
            let effect = match c.effect_size {
                Some(d) => format!("{:+.4}", d),
                None => "n/a".to_string(),
            };
            out.push_str(&format!(
                "{:<10} {} vs {}: diff {:+.4}, p = {:.6}, d = {}{}\n",
                c.metric,
                index_of(&c.system_a).map(system_label).unwrap_or_default(),
                index_of(&c.system_b).map(system_label).unwrap_or_default(),
                c.mean_difference,
                c.p_value,
                effect,
                if c.significant { " *" } else { "" }
            ));
        }

        out
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::significance::compare::tests::{sample_qrels, sample_runs, settings};
    use crate::significance::compare::SignificanceComparer;

    fn sample_report() -> ComparisonReport {
        SignificanceComparer::new(settings(true))
            .compare("toy", &sample_qrels(), &sample_runs())
            .unwrap()
    }

    #[test]
    fn test_write_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("reports/nested/toy");
        let writer = ReportWriter::new();

        let (txt1, json1) = writer.write(&sample_report(), &base).unwrap();
        let first = (fs::read(&txt1).unwrap(), fs::read(&json1).unwrap());

        let (txt2, json2) = writer.write(&sample_report(), &base).unwrap();
        let second = (fs::read(&txt2).unwrap(), fs::read(&json2).unwrap());

        assert_eq!(txt1, dir.path().join("reports/nested/toy.txt"));
        assert_eq!(json1, dir.path().join("reports/nested/toy.json"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_json_contains_comparisons() {
        let json = ReportWriter::new().render_json(&sample_report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["dataset"], "toy");
        assert_eq!(value["comparisons"].as_array().unwrap().len(), 2);
        assert!(value["comparisons"][0]["p_value"].is_number());
        assert_eq!(value["test"], "student");
    }

    #[test]
    fn test_text_table_layout() {
        let mut report = sample_report();
        // Force a significant win for "good" on mrr@10
        report.comparisons[0].significant = true;

        let text = ReportWriter::new().render_text(&report);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Significance report: toy");
        assert!(lines[3].starts_with("#  Model  mrr@10"));
        assert!(lines[5].starts_with("a  good   1.0000ᵇ"));
        assert!(lines[6].starts_with("b  bad"));
        assert!(!lines[6].contains('ᵃ'));
        assert!(text.contains("mrr@10     a vs b"));
    }

    #[test]
    fn test_system_labels() {
        assert_eq!(system_label(0), "a");
        assert_eq!(system_label(25), "z");
        assert_eq!(system_label(26), "a26");
        assert_eq!(superscript(1), "ᵇ");
        assert_eq!(superscript(30), "^a30");
    }
}
