//! # Cloze Shift Eval
//!
//! Measures how a language model's answer distribution shifts when a prompt
//! names a different city.
//!
//! Each stub template is rendered once per condition (a city, or a neutral
//! placeholder used as the reference). The model is sampled several times per
//! prompt and its top-K log-probabilities are turned into one normalized
//! distribution with an explicit `OTHER` bucket. Each condition is then scored
//! by its L1 distance to the reference over the reference's label support, and
//! distances are averaged over the whole dataset.
//!
//! ## Architecture
//!
//! ```text
//! Stub templates
//!        ↓
//! Prompt variants (one per condition)
//!        ↓
//! Model queries (N samples, bounded pool, retry with backoff)
//!        ↓
//! add OTHER → clean labels → pool samples
//!        ↓
//! Per-stub condition groups → distance to reference
//!        ↓
//! Cohort means (+ bootstrap CI)
//! ```

pub mod completion;
pub mod config;
pub mod dataset;
pub mod distribution;
pub mod masked;
pub mod report;
pub mod runner;
pub mod scoring;
pub mod variants;

pub use completion::{
    classify_status, first_line, parse_completion_response, Completion, CompletionError,
    CompletionModel, HttpCompletionModel, RetryPolicy, Retryable,
};
pub use config::{
    BootstrapSettings, ConditionSpec, ConfigError, ExperimentConfig, GenerativeSettings,
    MaskedSettings, RetrySettings,
};
pub use dataset::{
    condition_groups, load_items, parse_items, read_results, results_path, write_results,
    DatasetError, DatasetLayout, Item, ResultRow,
};
pub use distribution::{
    clean_label, distribution_from_samples, pool_samples, Distribution, DistributionError,
    LogProbMap, MASS_TOLERANCE, OTHER,
};
pub use masked::{
    likelihood_from_loss, score_masked_item, BestFill, CommandScorer, MaskedError, MaskedResult,
    MaskedScorer, ScorerHandle,
};
pub use report::{
    bootstrap_ci, write_masked_results, CohortReport, ConditionReport, ReportBuilder,
    ReportMetadata,
};
pub use runner::{ItemFailure, QueryRunner, RunOutcome, RunnerConfig, RunnerError};
pub use scoring::{
    score_cohort, CohortAggregator, CohortSummary, ConditionGroup, DistancePolicy, ScoringError,
};
pub use variants::{format_variants, generate_variants, load_variants};
