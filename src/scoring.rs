//! Condition scoring against a neutral reference, and cohort aggregation.
//!
//! Each stub is rendered once per condition. The reference condition's labels
//! define the canonical support; every other condition is folded onto that
//! support and compared with an L1 distance. Per-item distances are then
//! averaged over the whole dataset.

use crate::distribution::{Distribution, OTHER};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while scoring conditions or aggregating a cohort
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoringError {
    #[error("Label mismatch in stub {stub_id}: condition {condition} has no probability for {label:?}")]
    LabelMismatch {
        stub_id: String,
        condition: String,
        label: String,
    },

    #[error("Stub {stub_id} has no reference condition {reference}")]
    MissingReference { stub_id: String, reference: String },

    #[error("Stub {stub_id} lists condition {condition} more than once")]
    DuplicateCondition { stub_id: String, condition: String },

    #[error("Aggregation mismatch: item {item} reports no distance for condition {condition}")]
    AggregationMismatch { item: String, condition: String },

    #[error("Aggregation mismatch: item {item} reports unexpected condition {condition}")]
    UnknownCondition { item: String, condition: String },

    #[error("No items to aggregate")]
    EmptyCohort,
}

/// How absolute label differences are combined into one distance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistancePolicy {
    /// Weight applied to the `OTHER` term (explicit labels weigh 1)
    #[serde(default = "default_other_weight")]
    pub other_weight: f64,
    /// Halve the sum, giving total-variation distance
    #[serde(default)]
    pub halved: bool,
}

const fn default_other_weight() -> f64 {
    1.0
}

impl Default for DistancePolicy {
    fn default() -> Self {
        Self {
            other_weight: default_other_weight(),
            halved: false,
        }
    }
}

impl DistancePolicy {
    /// Total-variation distance: halved, `OTHER` weighted like any label
    #[must_use]
    pub const fn total_variation() -> Self {
        Self {
            other_weight: 1.0,
            halved: true,
        }
    }

    fn weight(&self, label: &str) -> f64 {
        if label == OTHER {
            self.other_weight
        } else {
            1.0
        }
    }
}

/// All conditions rendered from one stub
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    /// Shared stub identifier
    pub stub_id: String,
    /// Letter of the reference condition
    pub reference_id: String,
    /// Reference distribution, defining the canonical support
    pub reference: Distribution,
    /// Every non-reference condition keyed by letter
    pub conditions: BTreeMap<String, Distribution>,
}

impl ConditionGroup {
    /// Create a group holding only its reference
    #[must_use]
    pub fn new(
        stub_id: impl Into<String>,
        reference_id: impl Into<String>,
        reference: Distribution,
    ) -> Self {
        Self {
            stub_id: stub_id.into(),
            reference_id: reference_id.into(),
            reference,
            conditions: BTreeMap::new(),
        }
    }

    /// Build a group from `(condition, distribution)` members of one stub.
    ///
    /// # Errors
    ///
    /// Fails if the reference is absent or a condition appears twice.
    pub fn from_members<I>(
        stub_id: impl Into<String>,
        reference_id: &str,
        members: I,
    ) -> Result<Self, ScoringError>
    where
        I: IntoIterator<Item = (String, Distribution)>,
    {
        let stub_id = stub_id.into();
        let mut reference = None;
        let mut others = Vec::new();

        for (condition, dist) in members {
            if condition == reference_id {
                if reference.replace(dist).is_some() {
                    return Err(ScoringError::DuplicateCondition {
                        stub_id,
                        condition,
                    });
                }
            } else {
                others.push((condition, dist));
            }
        }

        let reference = reference.ok_or_else(|| ScoringError::MissingReference {
            stub_id: stub_id.clone(),
            reference: reference_id.to_string(),
        })?;

        let mut group = Self::new(stub_id, reference_id, reference);
        for (condition, dist) in others {
            group.insert(condition, dist)?;
        }
        Ok(group)
    }

    /// Add a non-reference condition
    ///
    /// # Errors
    ///
    /// Fails if the condition is already present or is the reference letter.
    pub fn insert(
        &mut self,
        condition: impl Into<String>,
        dist: Distribution,
    ) -> Result<(), ScoringError> {
        let condition = condition.into();
        if condition == self.reference_id || self.conditions.contains_key(&condition) {
            return Err(ScoringError::DuplicateCondition {
                stub_id: self.stub_id.clone(),
                condition,
            });
        }
        self.conditions.insert(condition, dist);
        Ok(())
    }

    /// Canonical labels: the reference's explicit (non-`OTHER`) labels
    #[must_use]
    pub fn canonical_labels(&self) -> BTreeSet<&str> {
        self.reference.labels().filter(|l| *l != OTHER).collect()
    }

    /// Distance of every non-reference condition from the reference.
    ///
    /// # Errors
    ///
    /// Returns [`ScoringError::LabelMismatch`] if a canonical label (or
    /// `OTHER`) is missing from the reference or from a folded condition.
    pub fn score(&self, policy: &DistancePolicy) -> Result<BTreeMap<String, f64>, ScoringError> {
        let canonical = self.canonical_labels();

        if !self.reference.contains(OTHER) {
            return Err(self.mismatch(&self.reference_id, OTHER));
        }

        self.conditions
            .iter()
            .map(|(condition, dist)| {
                let folded = fold_onto_support(dist, &canonical);
                self.distance(condition, &folded, &canonical, policy)
                    .map(|d| (condition.clone(), d))
            })
            .collect()
    }

    fn distance(
        &self,
        condition: &str,
        folded: &Distribution,
        canonical: &BTreeSet<&str>,
        policy: &DistancePolicy,
    ) -> Result<f64, ScoringError> {
        let mut total = 0.0;

        for label in canonical.iter().copied().chain(std::iter::once(OTHER)) {
            let reference = self
                .reference
                .get(label)
                .ok_or_else(|| self.mismatch(&self.reference_id, label))?;
            let observed = folded
                .get(label)
                .ok_or_else(|| self.mismatch(condition, label))?;

            total += policy.weight(label) * (reference - observed).abs();
        }

        Ok(if policy.halved { total / 2.0 } else { total })
    }

    fn mismatch(&self, condition: &str, label: &str) -> ScoringError {
        ScoringError::LabelMismatch {
            stub_id: self.stub_id.clone(),
            condition: condition.to_string(),
            label: label.to_string(),
        }
    }
}

/// Fold every label outside `canonical` into `OTHER`.
#[must_use]
pub fn fold_onto_support(dist: &Distribution, canonical: &BTreeSet<&str>) -> Distribution {
    let mut folded = Distribution::new();
    for (label, prob) in dist.iter() {
        if label == OTHER || canonical.contains(label) {
            folded.accumulate(label, prob);
        } else {
            folded.accumulate(OTHER, prob);
        }
    }
    folded
}

/// Accumulates per-item condition distances over a dataset
#[derive(Debug, Clone)]
pub struct CohortAggregator {
    expected: BTreeSet<String>,
    distances: BTreeMap<String, Vec<f64>>,
    items: usize,
}

impl CohortAggregator {
    /// Create an aggregator for a fixed alphabet of non-reference conditions
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected: BTreeSet<String> = expected.into_iter().map(Into::into).collect();
        let distances = expected.iter().map(|c| (c.clone(), Vec::new())).collect();
        Self {
            expected,
            distances,
            items: 0,
        }
    }

    /// Record one item's condition distances.
    ///
    /// The item is rejected as a whole if it misses an expected condition or
    /// reports an unexpected one.
    ///
    /// # Errors
    ///
    /// Returns an aggregation-mismatch error naming the item and condition.
    pub fn add(&mut self, item: &str, scores: &BTreeMap<String, f64>) -> Result<(), ScoringError> {
        if let Some(missing) = self.expected.iter().find(|c| !scores.contains_key(*c)) {
            return Err(ScoringError::AggregationMismatch {
                item: item.to_string(),
                condition: missing.clone(),
            });
        }
        if let Some(extra) = scores.keys().find(|c| !self.expected.contains(*c)) {
            return Err(ScoringError::UnknownCondition {
                item: item.to_string(),
                condition: extra.clone(),
            });
        }

        for (condition, distance) in scores {
            if let Some(values) = self.distances.get_mut(condition) {
                values.push(*distance);
            }
        }
        self.items += 1;
        Ok(())
    }

    /// Number of items recorded so far
    #[must_use]
    pub const fn len(&self) -> usize {
        self.items
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Reduce to per-condition means
    ///
    /// # Errors
    ///
    /// Returns [`ScoringError::EmptyCohort`] if no item was recorded.
    #[allow(clippy::cast_precision_loss)]
    pub fn finish(self) -> Result<CohortSummary, ScoringError> {
        if self.items == 0 {
            return Err(ScoringError::EmptyCohort);
        }

        let n = self.items as f64;
        let means = self
            .distances
            .iter()
            .map(|(c, values)| (c.clone(), values.iter().sum::<f64>() / n))
            .collect();

        Ok(CohortSummary {
            items: self.items,
            means,
            distances: self.distances,
        })
    }
}

/// Per-condition mean distances over a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSummary {
    /// Number of contributing items
    pub items: usize,
    /// Mean distance per condition
    pub means: BTreeMap<String, f64>,
    /// Raw per-item distances per condition, in item order
    pub distances: BTreeMap<String, Vec<f64>>,
}

/// Score every group and aggregate the results.
///
/// # Errors
///
/// Propagates the first label or aggregation mismatch.
pub fn score_cohort<'a, I>(
    groups: I,
    expected: &[String],
    policy: &DistancePolicy,
) -> Result<CohortSummary, ScoringError>
where
    I: IntoIterator<Item = &'a ConditionGroup>,
{
    let mut aggregator = CohortAggregator::new(expected.iter().cloned());
    for group in groups {
        let scores = group.score(policy)?;
        tracing::debug!(stub = %group.stub_id, conditions = scores.len(), "Scored stub");
        aggregator.add(&group.stub_id, &scores)?;
    }
    aggregator.finish()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn dist(entries: &[(&str, f64)]) -> Distribution {
        entries.iter().copied().collect()
    }

    fn reference() -> Distribution {
        dist(&[("Tokyo", 0.5), ("London", 0.3), (OTHER, 0.2)])
    }

    #[test]
    fn test_self_distance_is_zero() {
        let mut group = ConditionGroup::new("0", "F", reference());
        group.insert("A", reference()).unwrap();

        let scores = group.score(&DistancePolicy::default()).unwrap();
        assert!(scores["A"].abs() < 1e-12);
    }

    #[test]
    fn test_unmatched_labels_fold_into_other() {
        let mut group = ConditionGroup::new("0", "F", reference());
        group
            .insert(
                "A",
                dist(&[("Tokyo", 0.4), ("London", 0.2), ("Paris", 0.1), (OTHER, 0.3)]),
            )
            .unwrap();

        let scores = group.score(&DistancePolicy::default()).unwrap();
        // |0.5-0.4| + |0.3-0.2| + |0.2-0.4|
        assert!((scores["A"] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_fold_creates_other_when_absent() {
        let canonical: BTreeSet<&str> = ["Tokyo"].into_iter().collect();
        let folded = fold_onto_support(&dist(&[("Tokyo", 0.6), ("Rome", 0.4)]), &canonical);
        assert_eq!(folded.get(OTHER), Some(0.4));
        assert!(!folded.contains("Rome"));
    }

    #[test]
    fn test_missing_canonical_label_is_error() {
        let mut group = ConditionGroup::new("7", "F", reference());
        group
            .insert("B", dist(&[("Tokyo", 0.4), ("Paris", 0.1), (OTHER, 0.5)]))
            .unwrap();

        let err = group.score(&DistancePolicy::default()).unwrap_err();
        assert_eq!(
            err,
            ScoringError::LabelMismatch {
                stub_id: "7".to_string(),
                condition: "B".to_string(),
                label: "London".to_string(),
            }
        );
    }

    #[test]
    fn test_reference_without_other_is_error() {
        let mut group = ConditionGroup::new("1", "F", dist(&[("Tokyo", 1.0)]));
        group.insert("A", dist(&[("Tokyo", 1.0)])).unwrap();
        assert!(matches!(
            group.score(&DistancePolicy::default()),
            Err(ScoringError::LabelMismatch { .. })
        ));
    }

    #[test]
    fn test_distance_symmetric_on_shared_support() {
        let a = reference();
        let b = dist(&[("Tokyo", 0.2), ("London", 0.5), (OTHER, 0.3)]);

        let mut forward = ConditionGroup::new("0", "F", a.clone());
        forward.insert("X", b.clone()).unwrap();
        let mut backward = ConditionGroup::new("0", "F", b);
        backward.insert("X", a).unwrap();

        let policy = DistancePolicy::default();
        let d1 = forward.score(&policy).unwrap()["X"];
        let d2 = backward.score(&policy).unwrap()["X"];
        assert!((d1 - d2).abs() < 1e-12);
    }

    #[test]
    fn test_policy_halving_and_other_weight() {
        let mut group = ConditionGroup::new("0", "F", reference());
        group
            .insert("A", dist(&[("Tokyo", 0.3), ("London", 0.3), (OTHER, 0.4)]))
            .unwrap();

        let plain = group.score(&DistancePolicy::default()).unwrap()["A"];
        let tv = group.score(&DistancePolicy::total_variation()).unwrap()["A"];
        let no_other = group
            .score(&DistancePolicy {
                other_weight: 0.0,
                halved: false,
            })
            .unwrap()["A"];

        assert!((plain - 0.4).abs() < 1e-12);
        assert!((tv - 0.2).abs() < 1e-12);
        assert!((no_other - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_from_members_requires_reference() {
        let members = vec![("A".to_string(), reference())];
        let err = ConditionGroup::from_members("3", "F", members).unwrap_err();
        assert!(matches!(err, ScoringError::MissingReference { .. }));
    }

    #[test]
    fn test_from_members_rejects_duplicates() {
        let members = vec![
            ("F".to_string(), reference()),
            ("A".to_string(), reference()),
            ("A".to_string(), reference()),
        ];
        let err = ConditionGroup::from_members("3", "F", members).unwrap_err();
        assert!(matches!(err, ScoringError::DuplicateCondition { .. }));
    }

    #[test]
    fn test_from_members_splits_reference() {
        let members = vec![
            ("A".to_string(), reference()),
            ("F".to_string(), reference()),
            ("B".to_string(), reference()),
        ];
        let group = ConditionGroup::from_members("3", "F", members).unwrap();
        assert_eq!(group.conditions.len(), 2);
        assert_eq!(group.canonical_labels().len(), 2);
    }

    #[test]
    fn test_cohort_mean() {
        let mut aggregator = CohortAggregator::new(["B"]);
        for (i, d) in [0.2, 0.4, 0.6].into_iter().enumerate() {
            let scores: BTreeMap<String, f64> = [("B".to_string(), d)].into_iter().collect();
            aggregator.add(&i.to_string(), &scores).unwrap();
        }

        let summary = aggregator.finish().unwrap();
        assert_eq!(summary.items, 3);
        assert!((summary.means["B"] - 0.4).abs() < 1e-12);
        assert_eq!(summary.distances["B"].len(), 3);
    }

    #[test]
    fn test_cohort_missing_condition_is_error() {
        let mut aggregator = CohortAggregator::new(["A", "B"]);
        let scores: BTreeMap<String, f64> = [("A".to_string(), 0.1)].into_iter().collect();

        let err = aggregator.add("4", &scores).unwrap_err();
        assert_eq!(
            err,
            ScoringError::AggregationMismatch {
                item: "4".to_string(),
                condition: "B".to_string(),
            }
        );
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_cohort_unknown_condition_is_error() {
        let mut aggregator = CohortAggregator::new(["A"]);
        let scores: BTreeMap<String, f64> = [("A".to_string(), 0.1), ("Z".to_string(), 0.2)]
            .into_iter()
            .collect();
        assert!(matches!(
            aggregator.add("0", &scores),
            Err(ScoringError::UnknownCondition { .. })
        ));
    }

    #[test]
    fn test_empty_cohort_is_error() {
        let aggregator = CohortAggregator::new(["A"]);
        assert_eq!(aggregator.finish(), Err(ScoringError::EmptyCohort));
    }

    #[test]
    fn test_score_cohort() {
        let mut first = ConditionGroup::new("0", "F", reference());
        first
            .insert("A", dist(&[("Tokyo", 0.4), ("London", 0.3), (OTHER, 0.3)]))
            .unwrap();
        let mut second = ConditionGroup::new("1", "F", reference());
        second
            .insert("A", dist(&[("Tokyo", 0.2), ("London", 0.3), (OTHER, 0.5)]))
            .unwrap();

        let summary = score_cohort(
            [&first, &second],
            &["A".to_string()],
            &DistancePolicy::default(),
        )
        .unwrap();
        // (0.2 + 0.6) / 2
        assert!((summary.means["A"] - 0.4).abs() < 1e-12);
    }
}
