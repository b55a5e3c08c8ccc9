//! Masked-fill collaborator.
//!
//! A masked language model scores how well each candidate string fills the
//! blank of a prompt (likelihood `exp(-loss)` from the cross-entropy loss
//! over the masked positions) and proposes its own best fill.
//!
//! The model is owned by the caller through a [`ScorerHandle`], loaded on first
//! use and reused across calls. The bundled backend, [`CommandScorer`], keeps
//! one scorer process alive and talks to it in JSON lines over stdin/stdout.

use crate::completion::Retryable;
use crate::config::MaskedSettings;
use crate::dataset::{escape_field, DatasetLayout, Item};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by the masked-fill scorer
#[derive(Error, Debug)]
pub enum MaskedError {
    #[error("Scorer tool not found: {0}")]
    ToolNotFound(String),

    #[error("Prompt must contain exactly one {marker:?} marker: {prompt}")]
    BlankMarker { marker: String, prompt: String },

    #[error("Scorer returned {got} losses for {expected} candidates")]
    LossCount { expected: usize, got: usize },

    #[error("Scorer failed: {0}")]
    ScorerFailed(String),

    #[error("Scorer process exited")]
    ScorerExited,

    #[error("Scorer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<MaskedError>,
    },

    #[error("Invalid response from scorer: {0}")]
    InvalidResponse(String),

    #[error("Scorer handle poisoned by a panicking thread")]
    Poisoned,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Retryable for MaskedError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    fn exhausted(attempts: usize, last: Self) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

/// Highest-likelihood fill proposed by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestFill {
    pub fill: String,
    /// Model score of the best fill (max logit)
    pub score: f64,
}

/// A masked language model
pub trait MaskedScorer: Send + Sync {
    /// The model's own best fill for the blank
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be queried.
    fn best_fill(&self, before: &str, after: &str) -> Result<BestFill, MaskedError>;

    /// Cross-entropy loss of each candidate filling the blank
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be queried.
    fn candidate_losses(
        &self,
        before: &str,
        after: &str,
        candidates: &[String],
    ) -> Result<Vec<f64>, MaskedError>;

    /// Likelihood of each candidate, in candidate order
    ///
    /// # Errors
    ///
    /// Returns an error if the model fails or returns the wrong number of losses.
    fn candidate_likelihoods(
        &self,
        before: &str,
        after: &str,
        candidates: &[String],
    ) -> Result<Vec<f64>, MaskedError> {
        let losses = self.candidate_losses(before, after, candidates)?;
        if losses.len() != candidates.len() {
            return Err(MaskedError::LossCount {
                expected: candidates.len(),
                got: losses.len(),
            });
        }
        Ok(losses.into_iter().map(likelihood_from_loss).collect())
    }
}

/// Negative log likelihood back to likelihood
#[must_use]
pub fn likelihood_from_loss(loss: f64) -> f64 {
    (-loss).exp()
}

/// Split a prompt around its single blank marker
///
/// # Errors
///
/// Returns [`MaskedError::BlankMarker`] unless the marker occurs exactly once.
pub fn split_blank<'a>(prompt: &'a str, marker: &str) -> Result<(&'a str, &'a str), MaskedError> {
    let mut parts = prompt.split(marker);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(before), Some(after), None) if !marker.is_empty() => Ok((before, after)),
        _ => Err(MaskedError::BlankMarker {
            marker: marker.to_string(),
            prompt: prompt.to_string(),
        }),
    }
}

/// Lazily-loaded scorer owned by the caller.
///
/// The loader runs at most once, on the first [`ScorerHandle::get`].
pub struct ScorerHandle<S> {
    loader: Box<dyn Fn() -> Result<S, MaskedError> + Send + Sync>,
    cell: OnceLock<S>,
    load_lock: Mutex<()>,
}

impl<S: MaskedScorer> ScorerHandle<S> {
    /// Create a handle that loads the scorer with `loader` on first use
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<S, MaskedError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            cell: OnceLock::new(),
            load_lock: Mutex::new(()),
        }
    }

    /// Create a handle around an already-loaded scorer
    #[must_use]
    pub fn loaded(scorer: S) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(scorer);
        Self {
            loader: Box::new(|| Err(MaskedError::ScorerFailed("scorer already loaded".into()))),
            cell,
            load_lock: Mutex::new(()),
        }
    }

    /// Borrow the scorer, loading it if needed
    ///
    /// # Errors
    ///
    /// Returns the loader's error; a later call retries the load.
    pub fn get(&self) -> Result<&S, MaskedError> {
        if let Some(scorer) = self.cell.get() {
            return Ok(scorer);
        }
        let _guard = self.load_lock.lock().map_err(|_| MaskedError::Poisoned)?;
        if let Some(scorer) = self.cell.get() {
            return Ok(scorer);
        }
        tracing::info!("Loading masked-fill scorer");
        let scorer = (self.loader)()?;
        Ok(self.cell.get_or_init(|| scorer))
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Release the scorer, returning it if it was loaded
    pub fn into_inner(self) -> Option<S> {
        self.cell.into_inner()
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScorerRequest<'a> {
    BestFill {
        before: &'a str,
        after: &'a str,
    },
    Losses {
        before: &'a str,
        after: &'a str,
        candidates: &'a [String],
    },
}

#[derive(Debug, Deserialize)]
struct BestFillResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    fill: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LossesResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    losses: Option<Vec<f64>>,
}

struct ScorerProcess {
    child: Child,
    stdin: ChildStdin,
    /// Response lines, read on a dedicated thread
    lines: Receiver<std::io::Result<String>>,
    /// Answers still owed for requests that timed out
    stale: usize,
}

/// Scorer backed by a long-lived external process.
///
/// Requests are answered in order, one JSON line each. A request that times
/// out leaves its late answer to be skipped by the next request.
pub struct CommandScorer {
    command: String,
    timeout: Duration,
    process: Mutex<ScorerProcess>,
}

impl CommandScorer {
    /// Check if the scorer executable is available
    #[must_use]
    pub fn is_available(command: &str) -> bool {
        let path = std::path::Path::new(command);
        if path.components().count() > 1 {
            return path.is_file();
        }
        std::env::var_os("PATH").is_some_and(|dirs| {
            std::env::split_paths(&dirs).any(|dir| dir.join(command).is_file())
        })
    }

    /// Start the scorer process
    ///
    /// # Errors
    ///
    /// Returns an error if the executable is missing or cannot be spawned.
    pub fn spawn(settings: &MaskedSettings) -> Result<Self, MaskedError> {
        if !Self::is_available(&settings.command) {
            return Err(MaskedError::ToolNotFound(settings.command.clone()));
        }

        let args = shell_words::split(&settings.args)
            .map_err(|e| MaskedError::ScorerFailed(format!("invalid args: {e}")))?;

        let mut child = Command::new(&settings.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(MaskedError::ScorerExited)?;
        let stdout = child.stdout.take().ok_or(MaskedError::ScorerExited)?;

        let (tx, lines) = mpsc::channel();
        std::thread::Builder::new()
            .name("masked-scorer-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        tracing::info!(command = %settings.command, "Started masked-fill scorer");

        Ok(Self {
            command: settings.command.clone(),
            timeout: settings.timeout(),
            process: Mutex::new(ScorerProcess {
                child,
                stdin,
                lines,
                stale: 0,
            }),
        })
    }

    /// Scorer executable name
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[allow(clippy::cast_possible_truncation)]
    fn exchange(&self, request: &ScorerRequest<'_>) -> Result<String, MaskedError> {
        let line = serde_json::to_string(request)
            .map_err(|e| MaskedError::InvalidResponse(e.to_string()))?;

        let mut process = self.process.lock().map_err(|_| MaskedError::Poisoned)?;
        writeln!(process.stdin, "{line}")?;
        process.stdin.flush()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match process.lines.recv_timeout(remaining) {
                Ok(response) if process.stale > 0 => {
                    process.stale -= 1;
                    tracing::debug!(command = %self.command, "Skipped late scorer answer");
                    response?;
                }
                Ok(response) => return Ok(response?),
                Err(RecvTimeoutError::Timeout) => {
                    process.stale += 1;
                    tracing::warn!(
                        command = %self.command,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Scorer timed out"
                    );
                    return Err(MaskedError::Timeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(MaskedError::ScorerExited),
            }
        }
    }
}

impl MaskedScorer for CommandScorer {
    fn best_fill(&self, before: &str, after: &str) -> Result<BestFill, MaskedError> {
        let raw = self.exchange(&ScorerRequest::BestFill { before, after })?;
        let response: BestFillResponse = serde_json::from_str(&raw)
            .map_err(|e| MaskedError::InvalidResponse(format!("{e}: {}", raw.trim())))?;

        if let Some(error) = response.error {
            return Err(MaskedError::ScorerFailed(error));
        }
        match (response.fill, response.score) {
            (Some(fill), Some(score)) => Ok(BestFill {
                fill: fill.trim().to_string(),
                score,
            }),
            _ => Err(MaskedError::InvalidResponse(raw.trim().to_string())),
        }
    }

    fn candidate_losses(
        &self,
        before: &str,
        after: &str,
        candidates: &[String],
    ) -> Result<Vec<f64>, MaskedError> {
        let raw = self.exchange(&ScorerRequest::Losses {
            before,
            after,
            candidates,
        })?;
        let response: LossesResponse = serde_json::from_str(&raw)
            .map_err(|e| MaskedError::InvalidResponse(format!("{e}: {}", raw.trim())))?;

        if let Some(error) = response.error {
            return Err(MaskedError::ScorerFailed(error));
        }
        response
            .losses
            .ok_or_else(|| MaskedError::InvalidResponse(raw.trim().to_string()))
    }
}

impl Drop for CommandScorer {
    fn drop(&mut self) {
        if let Ok(process) = self.process.get_mut() {
            let _ = process.child.kill();
            let _ = process.child.wait();
        }
    }
}

/// Masked-fill result for one item
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedResult {
    pub item: Item,
    /// The model's own best fill, also scored as the last candidate
    pub best_fill: String,
    pub best_score: f64,
    /// `(candidate, likelihood)` in candidate order
    pub likelihoods: Vec<(String, f64)>,
}

impl MaskedResult {
    /// Render as one TSV line: fixed item fields then candidate/likelihood pairs
    #[must_use]
    pub fn to_tsv_line(&self) -> String {
        let mut cols: Vec<String> = self
            .item
            .fields(DatasetLayout::Masked)
            .iter()
            .map(|f| escape_field(f))
            .collect();
        for (candidate, likelihood) in &self.likelihoods {
            cols.push(escape_field(candidate));
            cols.push(likelihood.to_string());
        }
        cols.join("\t")
    }
}

/// Score one masked-layout item: best fill first, then every candidate plus
/// the best fill.
///
/// # Errors
///
/// Returns an error if the prompt has no single blank or the scorer fails.
pub fn score_masked_item<S>(scorer: &S, item: &Item, blank: &str) -> Result<MaskedResult, MaskedError>
where
    S: MaskedScorer + ?Sized,
{
    let (before, after) = split_blank(&item.prompt, blank)?;
    let best = scorer.best_fill(before, after)?;

    let mut candidates = item.candidates.clone();
    candidates.push(best.fill.clone());

    let likelihoods = scorer.candidate_likelihoods(before, after, &candidates)?;

    Ok(MaskedResult {
        item: item.clone(),
        best_fill: best.fill,
        best_score: best.score,
        likelihoods: candidates.into_iter().zip(likelihoods).collect(),
    })
}
