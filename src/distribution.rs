//! Categorical distributions over fill-in-the-blank labels.
//!
//! A generative model returns the log-probabilities of its top-K candidate
//! tokens for one sample. This module turns those into proper distributions:
//!
//! 1. [`LogProbMap::add_other`] closes the mass with a residual `OTHER` label
//! 2. [`Distribution::reconcile_labels`] collapses textually-equivalent labels
//! 3. [`pool_samples`] merges repeated samples of one prompt by additive pooling

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reserved label carrying the mass the model did not return explicitly.
pub const OTHER: &str = "OTHER";

/// Tolerance for probability-sum invariants.
pub const MASS_TOLERANCE: f64 = 1e-9;

/// Errors raised while building or pooling distributions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("Malformed model response: top-K mass {mass} leaves no residual for OTHER")]
    MassExceeded { mass: f64 },

    #[error("Malformed model response: log-probability {value} for {label:?} is not finite and <= 0")]
    InvalidLogProb { label: String, value: f64 },

    #[error("Malformed model response: mass {mass} does not close to 1 despite an existing OTHER entry")]
    UnbalancedOther { mass: f64 },

    #[error("Probability mass lost while adding OTHER: total is {mass}")]
    MassLost { mass: f64 },

    #[error("Cannot pool an empty sample set")]
    EmptySampleSet,

    #[error("Pooled samples carry no probability mass")]
    ZeroMass,
}

/// Natural-log probabilities keyed by candidate token, one per model sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogProbMap(BTreeMap<String, f64>);

impl LogProbMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the log-probability of a token
    pub fn insert(&mut self, token: impl Into<String>, log_prob: f64) {
        self.0.insert(token.into(), log_prob);
    }

    /// Log-probability of a token, if present
    #[must_use]
    pub fn get(&self, token: &str) -> Option<f64> {
        self.0.get(token).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Linear probability mass carried by the map
    #[must_use]
    pub fn linear_mass(&self) -> f64 {
        self.0.values().map(|v| v.exp()).sum()
    }

    /// Add the residual `OTHER` entry so the map describes a full distribution.
    ///
    /// `OTHER` receives `ln(1 - Σ exp(v))`. A map that already carries `OTHER`
    /// and closes to 1 is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns a malformed-response error if any log-probability is positive or
    /// non-finite, if the observed mass is not below 1, or if an existing
    /// `OTHER` entry does not close the mass.
    pub fn add_other(mut self) -> Result<Self, DistributionError> {
        for (label, value) in &self.0 {
            if !value.is_finite() || *value > 0.0 {
                return Err(DistributionError::InvalidLogProb {
                    label: label.clone(),
                    value: *value,
                });
            }
        }

        let mass = self.linear_mass();

        if self.0.contains_key(OTHER) {
            if (mass - 1.0).abs() <= MASS_TOLERANCE {
                return Ok(self);
            }
            return Err(DistributionError::UnbalancedOther { mass });
        }

        if mass >= 1.0 {
            return Err(DistributionError::MassExceeded { mass });
        }

        self.0.insert(OTHER.to_string(), (1.0 - mass).ln());

        let closed = self.linear_mass();
        if (closed - 1.0).abs() > MASS_TOLERANCE {
            return Err(DistributionError::MassLost { mass: closed });
        }

        Ok(self)
    }

    /// Convert to linear probabilities without renormalizing
    #[must_use]
    pub fn into_distribution(self) -> Distribution {
        Distribution(self.0.into_iter().map(|(k, v)| (k, v.exp())).collect())
    }
}

impl FromIterator<(String, f64)> for LogProbMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, f64)> for LogProbMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Linear probabilities keyed by label, sorted by label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution(BTreeMap<String, f64>);

impl Distribution {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the probability of a label
    pub fn insert(&mut self, label: impl Into<String>, prob: f64) {
        self.0.insert(label.into(), prob);
    }

    /// Add mass to a label, creating it if absent
    pub fn accumulate(&mut self, label: impl Into<String>, prob: f64) {
        *self.0.entry(label.into()).or_insert(0.0) += prob;
    }

    /// Remove a label, returning its probability
    pub fn remove(&mut self, label: &str) -> Option<f64> {
        self.0.remove(label)
    }

    #[must_use]
    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.get(label).copied()
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.0.contains_key(label)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(label, probability)` pairs in label order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Labels in sorted order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.0.values().sum()
    }

    /// Whether the values sum to 1 within [`MASS_TOLERANCE`]
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        (self.total_mass() - 1.0).abs() <= MASS_TOLERANCE
    }

    /// Clean every label and merge entries whose cleaned labels collide.
    ///
    /// Colliding entries have their probabilities summed.
    #[must_use]
    pub fn reconcile_labels(self) -> Self {
        let mut cleaned = Self::new();
        for (label, prob) in self.0 {
            cleaned.accumulate(clean_label(&label), prob);
        }
        cleaned
    }
}

impl FromIterator<(String, f64)> for Distribution {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, f64)> for Distribution {
    fn from_iter<I: IntoIterator<Item = (&'a str, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Canonical form of a tokenizer label.
///
/// Literal `\n` escape sequences become real newlines, then surrounding
/// whitespace is trimmed. Applying it twice gives the same result.
///
/// Whitespace-only tokens (a bare newline, spaces) all become the empty
/// label `""`, which is kept as a label of its own and merged with its
/// collisions like any other.
#[must_use]
pub fn clean_label(label: &str) -> String {
    label.replace("\\n", "\n").trim().to_string()
}

/// Pool repeated samples of one prompt into a single distribution.
///
/// Linear probabilities are summed per label over the union of labels seen
/// in any sample, then divided by the grand total. Samples therefore
/// contribute in proportion to their own mass.
///
/// # Errors
///
/// Returns an error if `samples` is empty or carries no mass.
pub fn pool_samples(samples: &[Distribution]) -> Result<Distribution, DistributionError> {
    if samples.is_empty() {
        return Err(DistributionError::EmptySampleSet);
    }

    let mut pooled = Distribution::new();
    for sample in samples {
        for (label, prob) in sample.iter() {
            pooled.accumulate(label, prob);
        }
    }

    let norm = pooled.total_mass();
    if norm <= 0.0 || !norm.is_finite() {
        return Err(DistributionError::ZeroMass);
    }

    for prob in pooled.0.values_mut() {
        *prob /= norm;
    }

    Ok(pooled)
}

/// Run one prompt's raw samples through normalization, label cleaning and
/// pooling.
///
/// # Errors
///
/// Fails if any sample is malformed or the sample set is empty.
pub fn distribution_from_samples(
    samples: Vec<LogProbMap>,
) -> Result<Distribution, DistributionError> {
    let cleaned = samples
        .into_iter()
        .map(|sample| {
            sample
                .add_other()
                .map(|closed| closed.into_distribution().reconcile_labels())
        })
        .collect::<Result<Vec<_>, _>>()?;

    pool_samples(&cleaned)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn log_map(entries: &[(&str, f64)]) -> LogProbMap {
        entries.iter().map(|(k, v)| (*k, v.ln())).collect()
    }

    fn dist(entries: &[(&str, f64)]) -> Distribution {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_add_other_closes_mass() {
        let map = log_map(&[("A", 0.25), ("B", 0.5)]);
        let closed = map.add_other().unwrap();

        assert!((closed.get(OTHER).unwrap().exp() - 0.25).abs() < 1e-12);
        assert!((closed.linear_mass() - 1.0).abs() <= MASS_TOLERANCE);
    }

    #[test]
    fn test_add_other_many_small_tokens() {
        let map: LogProbMap = (0..5)
            .map(|i| (format!("tok{i}"), (0.1 + f64::from(i) * 0.03).ln()))
            .collect();
        let closed = map.add_other().unwrap();
        assert_eq!(closed.len(), 6);
        assert!((closed.linear_mass() - 1.0).abs() <= MASS_TOLERANCE);
    }

    #[test]
    fn test_add_other_rejects_excess_mass() {
        let map = log_map(&[("A", 0.7), ("B", 0.4)]);
        let err = map.add_other().unwrap_err();
        assert!(matches!(err, DistributionError::MassExceeded { .. }));
    }

    #[test]
    fn test_add_other_rejects_full_mass_without_other() {
        let map = log_map(&[("A", 1.0)]);
        assert!(matches!(
            map.add_other(),
            Err(DistributionError::MassExceeded { .. })
        ));
    }

    #[test]
    fn test_add_other_rejects_positive_log_prob() {
        let mut map = LogProbMap::new();
        map.insert("A", 0.3);
        let err = map.add_other().unwrap_err();
        assert!(matches!(err, DistributionError::InvalidLogProb { .. }));
    }

    #[test]
    fn test_add_other_rejects_nan() {
        let mut map = LogProbMap::new();
        map.insert("A", f64::NAN);
        assert!(map.add_other().is_err());
    }

    #[test]
    fn test_add_other_is_noop_on_closed_map() {
        let closed = log_map(&[("A", 0.25), ("B", 0.5)]).add_other().unwrap();
        let again = closed.clone().add_other().unwrap();
        assert_eq!(closed, again);
    }

    #[test]
    fn test_add_other_rejects_open_map_with_other() {
        let map = log_map(&[("A", 0.25), (OTHER, 0.25)]);
        assert!(matches!(
            map.add_other(),
            Err(DistributionError::UnbalancedOther { .. })
        ));
    }

    #[test]
    fn test_empty_map_gets_all_mass_in_other() {
        let closed = LogProbMap::new().add_other().unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed.get(OTHER).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("  Tokyo "), "Tokyo");
        assert_eq!(clean_label("\\n"), "");
        assert_eq!(clean_label("a\\nb"), "a\nb");
        assert_eq!(clean_label(" a\\n"), "a");
    }

    #[test]
    fn test_whitespace_tokens_share_empty_label() {
        let dist: Distribution = [
            ("\n", 0.3),
            ("\n\n", 0.2),
            ("\\n ", 0.003),
            ("Tokyo", 0.4),
            (OTHER, 0.097),
        ]
        .into_iter()
        .collect();
        let cleaned = dist.reconcile_labels();

        assert_eq!(cleaned.len(), 3);
        assert!((cleaned.get("").unwrap() - 0.503).abs() < 1e-12);
        assert!(cleaned.is_normalized());
    }

    #[test]
    fn test_clean_label_idempotent() {
        for raw in [" x ", "x\\n", "\\n\\ny", "a\\\\n", "\t z\\n "] {
            let once = clean_label(raw);
            assert_eq!(clean_label(&once), once, "raw = {raw:?}");
        }
    }

    #[test]
    fn test_reconcile_sums_collisions() {
        let d = dist(&[(" London", 0.2), ("London", 0.3), ("Paris ", 0.1), (OTHER, 0.4)]);
        let reconciled = d.reconcile_labels();

        assert_eq!(reconciled.len(), 3);
        assert!((reconciled.get("London").unwrap() - 0.5).abs() < 1e-12);
        assert!((reconciled.total_mass() - 1.0).abs() <= MASS_TOLERANCE);
    }

    #[test]
    fn test_reconcile_idempotent_on_clean_input() {
        let d = dist(&[("London", 0.3), ("Tokyo", 0.5), (OTHER, 0.2)]);
        assert_eq!(d.clone().reconcile_labels(), d);
    }

    #[test]
    fn test_pool_identical_samples() {
        let d = dist(&[("London", 0.3), ("Tokyo", 0.5), (OTHER, 0.2)]);
        let pooled = pool_samples(&vec![d.clone(); 5]).unwrap();

        for (label, prob) in d.iter() {
            assert!((pooled.get(label).unwrap() - prob).abs() < 1e-12);
        }
    }

    #[test]
    fn test_pool_order_independent() {
        let a = dist(&[("London", 0.3), ("Tokyo", 0.5), (OTHER, 0.2)]);
        let b = dist(&[("Paris", 0.6), (OTHER, 0.4)]);
        let c = dist(&[("Tokyo", 0.1), ("Rome", 0.2), (OTHER, 0.7)]);

        let forward = pool_samples(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let backward = pool_samples(&[c, a, b]).unwrap();

        assert_eq!(forward.len(), backward.len());
        for (label, prob) in forward.iter() {
            assert!((backward.get(label).unwrap() - prob).abs() < 1e-12);
        }
    }

    #[test]
    fn test_pool_union_of_labels() {
        let a = dist(&[("London", 0.6), (OTHER, 0.4)]);
        let b = dist(&[("Paris", 0.6), (OTHER, 0.4)]);
        let pooled = pool_samples(&[a, b]).unwrap();

        assert!((pooled.get("London").unwrap() - 0.3).abs() < 1e-12);
        assert!((pooled.get("Paris").unwrap() - 0.3).abs() < 1e-12);
        assert!((pooled.get(OTHER).unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_pool_weights_by_sample_mass() {
        let first: LogProbMap = [("A", -0.1), (OTHER, -2.3)].into_iter().collect();
        let second: LogProbMap = [("A", -0.2), (OTHER, -1.6)].into_iter().collect();
        let m1 = first.linear_mass();
        let m2 = second.linear_mass();

        let pooled =
            pool_samples(&[first.into_distribution(), second.into_distribution()]).unwrap();
        assert!(pooled.is_normalized());

        let expected = ((-0.1_f64).exp() + (-0.2_f64).exp()) / (m1 + m2);
        let flat = ((-0.1_f64).exp() / m1 + (-0.2_f64).exp() / m2) / 2.0;
        let a = pooled.get("A").unwrap();
        assert!((a - expected).abs() < 1e-12);
        assert!((a - flat).abs() > 1e-6);
    }

    #[test]
    fn test_pool_empty_is_error() {
        assert_eq!(pool_samples(&[]), Err(DistributionError::EmptySampleSet));
    }

    #[test]
    fn test_pool_zero_mass_is_error() {
        let d = dist(&[("A", 0.0)]);
        assert_eq!(pool_samples(&[d]), Err(DistributionError::ZeroMass));
    }

    #[test]
    fn test_distribution_from_samples() {
        let samples = vec![
            log_map(&[(" Tokyo", 0.5), ("London", 0.3)]),
            log_map(&[("Tokyo", 0.4), ("Paris\\n", 0.2)]),
        ];
        let pooled = distribution_from_samples(samples).unwrap();

        assert!(pooled.is_normalized());
        assert!((pooled.get("Tokyo").unwrap() - 0.45).abs() < 1e-12);
        assert!((pooled.get("London").unwrap() - 0.15).abs() < 1e-12);
        assert!((pooled.get("Paris").unwrap() - 0.1).abs() < 1e-12);
        assert!((pooled.get(OTHER).unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_distribution_from_samples_propagates_malformed() {
        let samples = vec![log_map(&[("A", 0.5)]), log_map(&[("A", 0.9), ("B", 0.3)])];
        assert!(matches!(
            distribution_from_samples(samples),
            Err(DistributionError::MassExceeded { .. })
        ));
    }

    #[test]
    fn test_log_prob_map_deserializes_from_json_object() {
        let map: LogProbMap = serde_json::from_str(r#"{" Tokyo": -0.5, " London": -1.2}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(" Tokyo"), Some(-0.5));
    }
}
