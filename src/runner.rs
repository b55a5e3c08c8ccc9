//! Query execution engine.
//!
//! Runs the per-item pipeline (sample the model, normalize, reconcile, pool)
//! on a bounded worker pool. Failed items are recorded rather than dropped or
//! replaced, and results come back in input order.

use crate::completion::{first_line, CompletionError, CompletionModel, RetryPolicy};
use crate::config::ExperimentConfig;
use crate::dataset::{Item, ResultRow};
use crate::distribution::{distribution_from_samples, DistributionError};
use crate::masked::{score_masked_item, MaskedError, MaskedResult, MaskedScorer, ScorerHandle};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

/// Errors that can occur while running items
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Model query failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Malformed model response: {0}")]
    Distribution(#[from] DistributionError),

    #[error("Masked scorer failed: {0}")]
    Masked(#[from] MaskedError),

    #[error("Worker pool could not be built: {0}")]
    Pool(String),
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum concurrent model queries
    pub max_concurrent: usize,
    /// Completions drawn per prompt
    pub samples: usize,
    /// Blank marker for masked-layout prompts
    pub blank: String,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&ExperimentConfig::default())
    }
}

impl From<&ExperimentConfig> for RunnerConfig {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            samples: config.generative.samples,
            blank: config.masked.blank.clone(),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// An item that could not be completed
#[derive(Debug)]
pub struct ItemFailure {
    /// Position of the item in the input
    pub index: usize,
    pub item: Item,
    pub error: RunnerError,
}

/// Results and failures of a run, each in input order
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub results: Vec<T>,
    pub failures: Vec<ItemFailure>,
}

impl<T> RunOutcome<T> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total items attempted
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    fn collect(outcomes: Vec<(usize, Item, Result<T, RunnerError>)>) -> Self {
        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (index, item, outcome) in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(error) => {
                    tracing::warn!(
                        item = index,
                        stub = %item.stub_id,
                        condition = %item.condition,
                        error = %error,
                        "Item failed"
                    );
                    failures.push(ItemFailure { index, item, error });
                }
            }
        }
        Self { results, failures }
    }
}

/// Runner for generative and masked-fill queries
pub struct QueryRunner {
    config: RunnerConfig,
    pool: ThreadPool,
}

impl QueryRunner {
    /// Create a runner with its own bounded worker pool
    ///
    /// # Errors
    ///
    /// Returns an error if the thread pool cannot be created.
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_concurrent.max(1))
            .thread_name(|i| format!("query-worker-{i}"))
            .build()
            .map_err(|e| RunnerError::Pool(e.to_string()))?;
        Ok(Self { config, pool })
    }

    /// Get current configuration
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Query one prompt and pool its samples into a result row
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails after retries or a sample is malformed.
    pub fn query_item<M>(&self, model: &M, item: &Item) -> Result<ResultRow, RunnerError>
    where
        M: CompletionModel + ?Sized,
    {
        let context = format!("stub {} condition {}", item.stub_id, item.condition);
        let completions = self
            .config
            .retry
            .run(&context, || model.sample(&item.prompt, self.config.samples))?;

        let mut texts = Vec::with_capacity(completions.len());
        let mut samples = Vec::with_capacity(completions.len());
        for completion in completions {
            texts.push(first_line(&completion.text));
            samples.push(completion.top_logprobs);
        }

        let distribution = distribution_from_samples(samples)?;
        tracing::debug!(
            stub = %item.stub_id,
            condition = %item.condition,
            labels = distribution.len(),
            "Pooled samples"
        );

        Ok(ResultRow {
            item: item.clone(),
            distribution,
            texts,
        })
    }

    /// Query every item on the worker pool
    pub fn run_generative<M>(&self, model: &M, items: &[Item]) -> RunOutcome<ResultRow>
    where
        M: CompletionModel + ?Sized,
    {
        tracing::info!(
            model = model.name(),
            items = items.len(),
            workers = self.config.max_concurrent,
            "Querying generative model"
        );

        let outcomes = self.pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .map(|(index, item)| (index, item.clone(), self.query_item(model, item)))
                .collect::<Vec<_>>()
        });

        RunOutcome::collect(outcomes)
    }

    /// Score every masked-layout item, loading the scorer on first use
    pub fn run_masked<S>(&self, handle: &ScorerHandle<S>, items: &[Item]) -> RunOutcome<MaskedResult>
    where
        S: MaskedScorer,
    {
        tracing::info!(items = items.len(), "Scoring masked fills");

        let outcomes = self.pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .map(|(index, item)| {
                    let context = format!("stub {} condition {}", item.stub_id, item.condition);
                    let result = handle
                        .get()
                        .and_then(|scorer| {
                            self.config.retry.run(&context, || {
                                score_masked_item(scorer, item, &self.config.blank)
                            })
                        })
                        .map_err(RunnerError::from);
                    (index, item.clone(), result)
                })
                .collect::<Vec<_>>()
        });

        RunOutcome::collect(outcomes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::distribution::{LogProbMap, OTHER};
    use crate::masked::BestFill;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn item(stub: &str, condition: &str, prompt: &str) -> Item {
        Item {
            stub_id: stub.to_string(),
            condition: condition.to_string(),
            label: "x".to_string(),
            prompt: prompt.to_string(),
            candidates: Vec::new(),
        }
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            max_concurrent: 2,
            samples: 2,
            blank: "BLANK".to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                max_backoff: Duration::from_millis(1),
            },
        }
    }

    fn completion(text: &str, entries: &[(&str, f64)]) -> Completion {
        Completion {
            text: text.to_string(),
            top_logprobs: entries.iter().map(|(k, p)| (*k, p.ln())).collect::<LogProbMap>(),
        }
    }

    /// Answers every prompt with the same two samples
    struct FixedModel;

    impl CompletionModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn sample(&self, prompt: &str, n: usize) -> Result<Vec<Completion>, CompletionError> {
            if prompt.contains("broken") {
                return Ok(vec![completion("x", &[("Yes", 0.9), ("No", 0.3)]); n]);
            }
            Ok((0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        completion(" Yes\nmore", &[(" Yes", 0.6), ("No", 0.2)])
                    } else {
                        completion("No", &[("Yes", 0.4), ("No", 0.4)])
                    }
                })
                .collect())
        }
    }

    /// Fails transiently a fixed number of times
    struct FlakyModel {
        failures: usize,
        calls: AtomicUsize,
    }

    impl CompletionModel for FlakyModel {
        fn name(&self) -> &str {
            "flaky"
        }

        fn sample(&self, prompt: &str, n: usize) -> Result<Vec<Completion>, CompletionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CompletionError::Transient("503".into()));
            }
            FixedModel.sample(prompt, n)
        }
    }

    struct EchoScorer;

    impl MaskedScorer for EchoScorer {
        fn best_fill(&self, _before: &str, _after: &str) -> Result<BestFill, MaskedError> {
            Ok(BestFill {
                fill: "rice".into(),
                score: 9.0,
            })
        }

        fn candidate_losses(
            &self,
            _before: &str,
            _after: &str,
            candidates: &[String],
        ) -> Result<Vec<f64>, MaskedError> {
            Ok(vec![0.0; candidates.len()])
        }
    }

    /// Times out on its first best-fill request only
    struct SlowOnceScorer {
        calls: AtomicUsize,
    }

    impl MaskedScorer for SlowOnceScorer {
        fn best_fill(&self, _before: &str, _after: &str) -> Result<BestFill, MaskedError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(MaskedError::Timeout(Duration::from_millis(5)));
            }
            EchoScorer.best_fill("", "")
        }

        fn candidate_losses(
            &self,
            before: &str,
            after: &str,
            candidates: &[String],
        ) -> Result<Vec<f64>, MaskedError> {
            EchoScorer.candidate_losses(before, after, candidates)
        }
    }

    #[test]
    fn test_masked_timeouts_are_retried() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let handle = ScorerHandle::loaded(SlowOnceScorer {
            calls: AtomicUsize::new(0),
        });
        let outcome = runner.run_masked(&handle, &[item("0", "A", "They ate BLANK.")]);

        assert!(outcome.is_complete());
        assert_eq!(outcome.results[0].best_fill, "rice");
        assert_eq!(handle.get().unwrap().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_masked_timeouts_exhaust_retries() {
        struct HungScorer;

        impl MaskedScorer for HungScorer {
            fn best_fill(&self, _before: &str, _after: &str) -> Result<BestFill, MaskedError> {
                Err(MaskedError::Timeout(Duration::from_millis(5)))
            }

            fn candidate_losses(
                &self,
                _before: &str,
                _after: &str,
                _candidates: &[String],
            ) -> Result<Vec<f64>, MaskedError> {
                Ok(Vec::new())
            }
        }

        let runner = QueryRunner::new(fast_config()).unwrap();
        let handle = ScorerHandle::loaded(HungScorer);
        let outcome = runner.run_masked(&handle, &[item("0", "A", "They ate BLANK.")]);

        assert!(matches!(
            outcome.failures[0].error,
            RunnerError::Masked(MaskedError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_runner_config_from_experiment() {
        let config = RunnerConfig::from(&ExperimentConfig::default());
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.samples, 5);
        assert_eq!(config.blank, "BLANK");
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn test_query_item_pools_and_captures_text() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let row = runner
            .query_item(&FixedModel, &item("0", "A", "prompt"))
            .unwrap();

        assert!(row.distribution.is_normalized());
        assert!((row.distribution.get("Yes").unwrap() - 0.5).abs() < 1e-9);
        assert!((row.distribution.get("No").unwrap() - 0.3).abs() < 1e-9);
        assert!((row.distribution.get(OTHER).unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(row.texts, vec!["Yes".to_string(), "No".to_string()]);
    }

    #[test]
    fn test_run_generative_preserves_order_and_records_failures() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let items: Vec<Item> = (0..6)
            .map(|i| {
                let prompt = if i == 3 { "broken" } else { "fine" };
                item(&i.to_string(), "A", prompt)
            })
            .collect();

        let outcome = runner.run_generative(&FixedModel, &items);

        assert_eq!(outcome.attempted(), 6);
        assert!(!outcome.is_complete());
        let stubs: Vec<&str> = outcome
            .results
            .iter()
            .map(|r| r.item.stub_id.as_str())
            .collect();
        assert_eq!(stubs, vec!["0", "1", "2", "4", "5"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 3);
        assert!(matches!(
            outcome.failures[0].error,
            RunnerError::Distribution(DistributionError::MassExceeded { .. })
        ));
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let model = FlakyModel {
            failures: 2,
            calls: AtomicUsize::new(0),
        };
        let row = runner.query_item(&model, &item("0", "A", "p")).unwrap();
        assert!(row.distribution.is_normalized());
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_retries_fail_the_item() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let model = FlakyModel {
            failures: 10,
            calls: AtomicUsize::new(0),
        };
        let outcome = runner.run_generative(&model, &[item("0", "A", "p")]);
        assert!(outcome.results.is_empty());
        assert!(matches!(
            outcome.failures[0].error,
            RunnerError::Completion(CompletionError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_run_masked() {
        let runner = QueryRunner::new(fast_config()).unwrap();
        let handle = ScorerHandle::new(|| Ok(EchoScorer));
        let mut good = item("0", "A", "They ate BLANK.");
        good.candidates = vec!["sushi".into()];
        let bad = item("1", "A", "no marker here");

        let outcome = runner.run_masked(&handle, &[good, bad]);

        assert!(handle.is_loaded());
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(
            outcome.results[0].likelihoods,
            vec![("sushi".to_string(), 1.0), ("rice".to_string(), 1.0)]
        );
        assert!(matches!(
            outcome.failures[0].error,
            RunnerError::Masked(MaskedError::BlankMarker { .. })
        ));
    }
}
