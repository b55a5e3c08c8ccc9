//! Report generation for cohort results.
//!
//! Renders the per-condition mean distances as plain `<name>: <mean>` lines,
//! a markdown table, or JSON with a bootstrap confidence interval on each
//! mean. Also exports masked-fill results as TSV.

use crate::config::{BootstrapSettings, ExperimentConfig};
use crate::masked::MaskedResult;
use crate::scoring::CohortSummary;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use std::path::Path;
use tabled::{Table, Tabled};

/// Full cohort report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortReport {
    pub metadata: ReportMetadata,
    /// One row per non-reference condition, in configured order
    pub conditions: Vec<ConditionReport>,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Framework version
    pub framework_version: String,
    /// Reference condition letter
    pub reference: String,
    /// Items contributing to the means
    pub items: usize,
    /// Bootstrap configuration used for the intervals
    pub bootstrap: BootstrapSettings,
}

/// Mean distance of one condition with its confidence interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionReport {
    pub letter: String,
    pub name: String,
    pub mean: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Bootstrap confidence interval of the mean (percentile method)
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], settings: &BootstrapSettings) -> (f64, f64) {
    let mean = if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    };
    if samples.len() < 2 || settings.resamples == 0 {
        return (mean, mean);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    let n = samples.len();
    let mut means: Vec<f64> = (0..settings.resamples)
        .map(|_| (0..n).map(|_| samples[rng.gen_range(0..n)]).sum::<f64>() / n as f64)
        .collect();
    means.sort_by(f64::total_cmp);

    let alpha = 1.0 - settings.confidence;
    let last = means.len() - 1;
    let lower_idx = ((means.len() as f64 * (alpha / 2.0)).floor() as usize).min(last);
    let upper_idx = ((means.len() as f64 * (1.0 - alpha / 2.0)).ceil() as usize).min(last);

    (means[lower_idx], means[upper_idx])
}

/// Report builder
pub struct ReportBuilder<'a> {
    title: String,
    config: &'a ExperimentConfig,
}

impl<'a> ReportBuilder<'a> {
    /// Create a new report builder
    #[must_use]
    pub fn new(title: &str, config: &'a ExperimentConfig) -> Self {
        Self {
            title: title.to_string(),
            config,
        }
    }

    /// Build the report from a cohort summary
    #[must_use]
    pub fn build(self, summary: &CohortSummary) -> CohortReport {
        let settings = &self.config.bootstrap;

        let mut letters = self.config.scored_letters();
        let unlisted: Vec<String> = summary
            .means
            .keys()
            .filter(|l| !letters.contains(*l))
            .cloned()
            .collect();
        letters.extend(unlisted);

        let conditions = letters
            .into_iter()
            .filter_map(|letter| {
                let mean = *summary.means.get(&letter)?;
                let (ci_lower, ci_upper) = summary
                    .distances
                    .get(&letter)
                    .map_or((mean, mean), |d| bootstrap_ci(d, settings));
                Some(ConditionReport {
                    name: self.config.display_name(&letter).to_string(),
                    letter,
                    mean,
                    ci_lower,
                    ci_upper,
                })
            })
            .collect();

        CohortReport {
            metadata: ReportMetadata {
                title: self.title,
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                reference: self.config.reference.clone(),
                items: summary.items,
                bootstrap: settings.clone(),
            },
            conditions,
        }
    }
}

/// Table row for markdown output
#[derive(Tabled)]
struct ConditionTableRow {
    #[tabled(rename = "Condition")]
    letter: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Mean distance")]
    mean: String,
    #[tabled(rename = "CI")]
    ci: String,
}

impl CohortReport {
    /// One `<name>: <mean>` line per condition
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();
        for c in &self.conditions {
            writeln!(output, "{}: {}", c.name, c.mean).ok();
        }
        output
    }

    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(
            output,
            "**Framework Version:** {}",
            self.metadata.framework_version
        )
        .ok();
        writeln!(
            output,
            "**Items:** {} (reference {})",
            self.metadata.items, self.metadata.reference
        )
        .ok();
        writeln!(output).ok();

        let rows: Vec<ConditionTableRow> = self
            .conditions
            .iter()
            .map(|c| ConditionTableRow {
                letter: c.letter.clone(),
                name: c.name.clone(),
                mean: format!("{:.4}", c.mean),
                ci: format!("[{:.4}, {:.4}]", c.ci_lower, c.ci_upper),
            })
            .collect();

        writeln!(output, "{}", Table::new(rows)).ok();
        writeln!(output).ok();

        writeln!(output, "## Configuration").ok();
        writeln!(output).ok();
        writeln!(
            output,
            "- Bootstrap resamples: {}",
            self.metadata.bootstrap.resamples
        )
        .ok();
        writeln!(
            output,
            "- Confidence level: {}%",
            self.metadata.bootstrap.confidence * 100.0
        )
        .ok();

        output
    }
}

/// Render masked-fill results as TSV
#[must_use]
pub fn format_masked_results(results: &[MaskedResult]) -> String {
    let mut out = String::new();
    for result in results {
        writeln!(out, "{}", result.to_tsv_line()).ok();
    }
    out
}

/// Write masked-fill results to a TSV file
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_masked_results<P: AsRef<Path>>(
    path: P,
    results: &[MaskedResult],
) -> std::io::Result<()> {
    std::fs::write(path, format_masked_results(results))
}
