//! Generative completion collaborator.
//!
//! The numeric pipeline only needs, per prompt, `n` independent samples with
//! the top-K log-probabilities at the first generated position. This module
//! defines that seam ([`CompletionModel`]), an HTTP client for an
//! OpenAI-compatible completions endpoint, and the bounded retry policy used
//! for transient failures.

use crate::config::{GenerativeSettings, RetrySettings};
use crate::distribution::LogProbMap;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a completion model
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Transient service failure: {0}")]
    Transient(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed completion response: {0}")]
    Malformed(String),

    #[error("API key not found in environment variable {0}")]
    MissingApiKey(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<CompletionError>,
    },
}

impl CompletionError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// An error a [`RetryPolicy`] knows how to retry
pub trait Retryable: std::fmt::Display + Sized {
    /// Whether retrying the same call may succeed
    fn is_transient(&self) -> bool;

    /// Wrap the last error once the attempt budget is spent
    fn exhausted(attempts: usize, last: Self) -> Self;
}

impl Retryable for CompletionError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }

    fn exhausted(attempts: usize, last: Self) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

/// Map an HTTP status to the response body or a typed failure.
///
/// 429 and 5xx are transient, any other non-2xx status is a rejection.
///
/// # Errors
///
/// Returns [`CompletionError::Transient`] or [`CompletionError::Rejected`].
pub fn classify_status(status: u16, body: String) -> Result<String, CompletionError> {
    match status {
        200..=299 => Ok(body),
        429 | 500..=599 => Err(CompletionError::Transient(format!("status {status}: {body}"))),
        _ => Err(CompletionError::Rejected { status, body }),
    }
}

/// One sampled completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text, trimmed and cut at the first newline
    pub text: String,
    /// Top-K candidate tokens at the first generated position
    pub top_logprobs: LogProbMap,
}

/// A generative model that can be sampled repeatedly for one prompt
pub trait CompletionModel: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    /// Draw `n` independent completions for `prompt`
    ///
    /// # Errors
    ///
    /// Returns a transient error for timeouts, rate limits and server
    /// failures, and a non-transient error for malformed or rejected calls.
    fn sample(&self, prompt: &str, n: usize) -> Result<Vec<Completion>, CompletionError>;
}

/// First line of a generated text, trimmed
#[must_use]
pub fn first_line(text: &str) -> String {
    text.trim().split('\n').next().unwrap_or_default().trim().to_string()
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    text: String,
    #[serde(default)]
    index: usize,
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    top_logprobs: Vec<Option<LogProbMap>>,
}

/// Parse a completions response body into exactly `n` samples.
///
/// # Errors
///
/// Returns [`CompletionError::Malformed`] if the body is not valid JSON, a
/// choice lacks first-position log-probabilities, or the choice count is
/// not `n`.
pub fn parse_completion_response(body: &str, n: usize) -> Result<Vec<Completion>, CompletionError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::Malformed(format!("invalid JSON: {e}")))?;

    if response.choices.len() != n {
        return Err(CompletionError::Malformed(format!(
            "expected {n} choices, got {}",
            response.choices.len()
        )));
    }

    let mut choices = response.choices;
    choices.sort_by_key(|c| c.index);

    choices
        .into_iter()
        .map(|choice| {
            let top_logprobs = choice
                .logprobs
                .and_then(|lp| lp.top_logprobs.into_iter().next().flatten())
                .ok_or_else(|| {
                    CompletionError::Malformed(format!(
                        "choice {} has no first-position top_logprobs",
                        choice.index
                    ))
                })?;
            Ok(Completion {
                text: first_line(&choice.text),
                top_logprobs,
            })
        })
        .collect()
}

/// Completion model backed by an OpenAI-compatible HTTP endpoint
pub struct HttpCompletionModel {
    client: reqwest::blocking::Client,
    settings: GenerativeSettings,
    api_key: String,
}

impl HttpCompletionModel {
    /// Create a client reading the API key from the configured variable
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or the client cannot be built.
    pub fn from_settings(settings: GenerativeSettings) -> Result<Self, CompletionError> {
        let api_key = std::env::var(&settings.api_key_env)
            .map_err(|_| CompletionError::MissingApiKey(settings.api_key_env.clone()))?;
        Self::with_api_key(settings, api_key)
    }

    /// Create a client with an explicit API key
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_api_key(
        settings: GenerativeSettings,
        api_key: impl Into<String>,
    ) -> Result<Self, CompletionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| CompletionError::Malformed(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings,
            api_key: api_key.into(),
        })
    }

    /// JSON request body for one prompt
    #[must_use]
    pub fn request_body(&self, prompt: &str, n: usize) -> serde_json::Value {
        json!({
            "model": self.settings.model,
            "prompt": prompt,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "top_p": self.settings.top_p,
            "n": n,
            "frequency_penalty": 0,
            "presence_penalty": 0,
            "logprobs": self.settings.logprobs,
            "stop": self.settings.stop,
        })
    }

    fn classify(&self, err: &reqwest::Error) -> CompletionError {
        if err.is_timeout() {
            CompletionError::Timeout(self.settings.timeout())
        } else if err.is_connect() || err.is_request() {
            CompletionError::Transient(err.to_string())
        } else {
            CompletionError::Malformed(err.to_string())
        }
    }
}

impl CompletionModel for HttpCompletionModel {
    fn name(&self) -> &str {
        &self.settings.model
    }

    fn sample(&self, prompt: &str, n: usize) -> Result<Vec<Completion>, CompletionError> {
        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt, n))
            .send()
            .map_err(|e| self.classify(&e))?;

        let status = response.status().as_u16();
        let body = response.text().map_err(|e| self.classify(&e))?;
        let body = classify_status(status, body)?;

        parse_completion_response(&body, n)
    }
}

/// Exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            multiplier: settings.multiplier,
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = retry.min(i32::MAX as usize) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_nan() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns non-transient errors immediately, and the error's
    /// retries-exhausted form once the attempt budget is spent.
    pub fn run<T, E, F>(&self, context: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => return Err(E::exhausted(attempts, err)),
                Err(err) => {
                    let delay = self.backoff(attempt - 1);
                    tracing::warn!(
                        context = %context,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
