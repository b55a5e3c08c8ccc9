//! Configuration module for experiment settings.
//!
//! Handles YAML experiment configuration loading. Every field has a default
//! matching the published experiment, so an empty file is a valid config.

use crate::scoring::DistancePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Reference condition {0} is not among the configured conditions")]
    UnknownReference(String),

    #[error("Condition {0} is configured more than once")]
    DuplicateCondition(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// One experimental condition: a city substituted into every stub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionSpec {
    /// Condition letter used in datasets
    pub letter: String,
    /// Text substituted for the placeholder
    pub city: String,
    /// Display name used in the cohort summary
    pub name: String,
}

impl ConditionSpec {
    fn new(letter: &str, city: &str, name: &str) -> Self {
        Self {
            letter: letter.to_string(),
            city: city.to_string(),
            name: name.to_string(),
        }
    }
}

fn default_conditions() -> Vec<ConditionSpec> {
    vec![
        ConditionSpec::new("A", "Tokyo", "Japan"),
        ConditionSpec::new("B", "London", "UK"),
        ConditionSpec::new("C", "New York", "US"),
        ConditionSpec::new("D", "Mexico City", "Mexico"),
        ConditionSpec::new("E", "Mumbai", "India"),
        ConditionSpec::new("F", "QQQ", "Neutral"),
    ]
}

fn default_reference() -> String {
    "F".to_string()
}

fn default_placeholder() -> String {
    "QQQ".to_string()
}

const fn default_max_concurrent() -> usize {
    4
}

/// Complete experiment configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    /// Ordered condition alphabet
    #[serde(default = "default_conditions")]
    pub conditions: Vec<ConditionSpec>,
    /// Letter of the neutral reference condition
    #[serde(default = "default_reference")]
    pub reference: String,
    /// Placeholder in stub templates replaced by each city
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    /// Generative completion settings
    #[serde(default)]
    pub generative: GenerativeSettings,
    /// Retry policy for transient service failures
    #[serde(default)]
    pub retry: RetrySettings,
    /// Worker pool bound for concurrent model queries
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Distance convention
    #[serde(default)]
    pub distance: DistancePolicy,
    /// Masked-fill scorer settings
    #[serde(default)]
    pub masked: MaskedSettings,
    /// Bootstrap settings for confidence intervals on mean distances
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            conditions: default_conditions(),
            reference: default_reference(),
            placeholder: default_placeholder(),
            generative: GenerativeSettings::default(),
            retry: RetrySettings::default(),
            max_concurrent: default_max_concurrent(),
            distance: DistancePolicy::default(),
            masked: MaskedSettings::default(),
            bootstrap: BootstrapSettings::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load and validate configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load and validate configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or validated.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for condition in &self.conditions {
            if !seen.insert(condition.letter.as_str()) {
                return Err(ConfigError::DuplicateCondition(condition.letter.clone()));
            }
        }
        if !seen.contains(self.reference.as_str()) {
            return Err(ConfigError::UnknownReference(self.reference.clone()));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.generative.samples == 0 {
            return Err(ConfigError::InvalidSetting(
                "generative.samples must be at least 1".to_string(),
            ));
        }
        if self.masked.timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "masked.timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.distance.other_weight.is_finite() || self.distance.other_weight < 0.0 {
            return Err(ConfigError::InvalidSetting(
                "distance.other_weight must be a finite non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    /// Letters of every non-reference condition, in configured order
    #[must_use]
    pub fn scored_letters(&self) -> Vec<String> {
        self.conditions
            .iter()
            .filter(|c| c.letter != self.reference)
            .map(|c| c.letter.clone())
            .collect()
    }

    /// Display name of a condition letter, falling back to the letter itself
    #[must_use]
    pub fn display_name<'a>(&'a self, letter: &'a str) -> &'a str {
        self.conditions
            .iter()
            .find(|c| c.letter == letter)
            .map_or(letter, |c| c.name.as_str())
    }
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/completions".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo-instruct".to_string()
}

const fn default_temperature() -> f64 {
    0.5
}

const fn default_max_tokens() -> u32 {
    10
}

const fn default_top_p() -> f64 {
    1.0
}

const fn default_logprobs() -> u32 {
    5
}

fn default_stop() -> String {
    ".".to_string()
}

const fn default_samples() -> usize {
    5
}

const fn default_timeout_ms() -> u64 {
    30_000
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Generative completion request settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerativeSettings {
    /// Completions endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Number of top candidate tokens returned per position
    #[serde(default = "default_logprobs")]
    pub logprobs: u32,
    /// Stop sequence
    #[serde(default = "default_stop")]
    pub stop: String,
    /// Repeated samples per prompt
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for GenerativeSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            logprobs: default_logprobs(),
            stop: default_stop(),
            samples: default_samples(),
            timeout_ms: default_timeout_ms(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl GenerativeSettings {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

const fn default_max_attempts() -> usize {
    4
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    8_000
}

/// Exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_blank() -> String {
    "BLANK".to_string()
}

fn default_masked_command() -> String {
    "fill-mask-scorer".to_string()
}

fn default_masked_args() -> String {
    "--model roberta-base".to_string()
}

/// Masked-fill scorer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaskedSettings {
    /// Scorer executable speaking JSON lines on stdin/stdout
    #[serde(default = "default_masked_command")]
    pub command: String,
    /// Extra arguments, shell-split
    #[serde(default = "default_masked_args")]
    pub args: String,
    /// Blank marker in masked-layout prompts
    #[serde(default = "default_blank")]
    pub blank: String,
    /// Per-request response timeout in milliseconds
    #[serde(default = "default_masked_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MaskedSettings {
    fn default() -> Self {
        Self {
            command: default_masked_command(),
            args: default_masked_args(),
            blank: default_blank(),
            timeout_ms: default_masked_timeout_ms(),
        }
    }
}

impl MaskedSettings {
    /// Per-request response timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

const fn default_masked_timeout_ms() -> u64 {
    60_000
}

const fn default_bootstrap_n() -> usize {
    10_000
}

const fn default_confidence() -> f64 {
    0.95
}

const fn default_seed() -> u64 {
    42
}

/// Bootstrap confidence-interval settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapSettings {
    /// Bootstrap resamples
    #[serde(default = "default_bootstrap_n")]
    pub resamples: usize,
    /// Confidence level
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Random seed for reproducibility
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            resamples: default_bootstrap_n(),
            confidence: default_confidence(),
            seed: default_seed(),
        }
    }
}
