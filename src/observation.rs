//! Observations, arms and the outcome models that bound them
//!
//! An [`Observation`] is immutable once created. Sequence numbers are
//! assigned at the ingestion boundary by a [`SequenceCounter`] unless the
//! producer supplies its own.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// Separator between the two arms in a comparison's display form and key.
pub const COMPARISON_SEPARATOR: &str = "__vs__";

// Everything but ASCII alphanumerics, '-' and '.' is escaped, so an encoded
// arm never contains '_' and the separator splits a key unambiguously.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.');

/// Identifier of one treatment variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArmId(String);

impl ArmId {
    /// Create an arm identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the identifier can name an arm: non-empty, no control
    /// characters or path separators, not `.`/`..`, and free of the
    /// comparison separator.
    ///
    /// # Errors
    ///
    /// Returns the reason the identifier was rejected.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let id = self.0.as_str();
        if id.is_empty() {
            return Err("arm id must not be empty".to_string());
        }
        if id == "." || id == ".." {
            return Err(format!("arm id {id:?} is reserved"));
        }
        if id.contains(COMPARISON_SEPARATOR) {
            return Err(format!("arm id {id:?} contains {COMPARISON_SEPARATOR:?}"));
        }
        if let Some(c) = id.chars().find(|c| matches!(c, '/' | '\\') || c.is_control()) {
            return Err(format!("arm id {id:?} contains forbidden character {c:?}"));
        }
        Ok(())
    }

    fn encoded(&self) -> String {
        utf8_percent_encode(&self.0, KEY_ENCODE_SET).to_string()
    }
}

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArmId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ArmId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Ordered pair of arms. The effect is always "B relative to A".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComparisonId {
    /// Baseline arm
    pub a: ArmId,
    /// Challenger arm
    pub b: ArmId,
}

impl ComparisonId {
    /// Create a comparison of `b` against baseline `a`.
    #[must_use]
    pub fn new(a: impl Into<ArmId>, b: impl Into<ArmId>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }

    /// Whether `arm` is one of the two sides.
    #[must_use]
    pub fn involves(&self, arm: &ArmId) -> bool {
        &self.a == arm || &self.b == arm
    }

    /// Validate both arm identifiers.
    ///
    /// # Errors
    ///
    /// See [`ArmId::validate`].
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.a.validate()?;
        self.b.validate()
    }

    /// Filesystem-safe key, e.g. `A__vs__B`. Each arm is percent-encoded
    /// (including `_`), so distinct comparisons never share a key and a key is
    /// always a single path component.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{COMPARISON_SEPARATOR}{}", self.a.encoded(), self.b.encoded())
    }
}

impl fmt::Display for ComparisonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{COMPARISON_SEPARATOR}{}", self.a, self.b)
    }
}

/// One per-arm outcome. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    arm: ArmId,
    value: f64,
    sequence: u64,
    observed_at: DateTime<Utc>,
}

impl Observation {
    /// Create an observation stamped with the current time.
    #[must_use]
    pub fn new(arm: impl Into<ArmId>, value: f64, sequence: u64) -> Self {
        Self::at(arm, value, sequence, Utc::now())
    }

    /// Create an observation with an explicit arrival time (replay, tests).
    #[must_use]
    pub fn at(arm: impl Into<ArmId>, value: f64, sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            arm: arm.into(),
            value,
            sequence,
            observed_at,
        }
    }

    /// Arm the outcome belongs to.
    #[must_use]
    pub const fn arm(&self) -> &ArmId {
        &self.arm
    }

    /// Outcome value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Arrival sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Arrival time.
    #[must_use]
    pub const fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Declared support of the outcome values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeModel {
    /// Conversion-style outcomes: exactly 0 or 1.
    Binary,
    /// Any finite value in `[lower, upper]`.
    Bounded {
        /// Smallest admissible value
        lower: f64,
        /// Largest admissible value
        upper: f64,
    },
    /// Any finite value.
    Continuous,
}

impl Default for OutcomeModel {
    fn default() -> Self {
        Self::Binary
    }
}

impl OutcomeModel {
    /// Check `value` against the model support.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the value is outside the support.
    pub fn check(&self, value: f64) -> std::result::Result<(), String> {
        if !value.is_finite() {
            return Err(format!("outcome {value} is not finite"));
        }
        match *self {
            Self::Binary if value != 0.0 && value != 1.0 => {
                Err(format!("binary outcome must be 0 or 1, got {value}"))
            }
            Self::Bounded { lower, upper } if value < lower || value > upper => {
                Err(format!("outcome {value} outside [{lower}, {upper}]"))
            }
            _ => Ok(()),
        }
    }

    /// Validate the model parameters themselves.
    ///
    /// # Errors
    ///
    /// Returns a reason when a bounded model has a non-finite or empty interval.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            Self::Bounded { lower, upper } if !(lower.is_finite() && upper.is_finite()) => {
                Err("bounded model limits must be finite".to_string())
            }
            Self::Bounded { lower, upper } if lower >= upper => {
                Err(format!("bounded model needs lower < upper, got [{lower}, {upper}]"))
            }
            _ => Ok(()),
        }
    }
}

/// Accumulated sufficient statistics of one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    /// Number of outcomes folded in
    pub count: u64,
    /// Sum of outcomes
    pub sum: f64,
    /// Sum of squared outcomes
    pub sum_sq: f64,
}

impl ArmStats {
    /// Fold one outcome in.
    pub fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    /// Sample mean, `None` before the first outcome.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Unbiased sample variance, `None` with fewer than two outcomes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let centered = self.sum_sq - self.sum * self.sum / n;
        Some((centered / (n - 1.0)).max(0.0))
    }
}

/// Monotonic sequence numbers for the ingestion boundary.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Counter whose first issued value is `start`.
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Issue the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Number [`next`](Self::next) would issue, without consuming it.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Make sure future numbers are strictly greater than `seen`.
    pub fn observe(&self, seen: u64) {
        self.next.fetch_max(seen.saturating_add(1), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_support() {
        let model = OutcomeModel::Binary;
        assert!(model.check(0.0).is_ok());
        assert!(model.check(1.0).is_ok());
        assert!(model.check(0.5).is_err());
        assert!(model.check(f64::NAN).is_err());
    }

    #[test]
    fn test_bounded_support() {
        let model = OutcomeModel::Bounded {
            lower: 0.0,
            upper: 10.0,
        };
        assert!(model.check(10.0).is_ok());
        assert!(model.check(-0.1).is_err());
        assert!(model.validate().is_ok());
        assert!(OutcomeModel::Bounded {
            lower: 1.0,
            upper: 1.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_continuous_rejects_infinity() {
        let model = OutcomeModel::Continuous;
        assert!(model.check(-1e300).is_ok());
        assert!(model.check(f64::INFINITY).is_err());
    }

    #[test]
    fn test_arm_stats_moments() {
        let mut stats = ArmStats::default();
        assert_eq!(stats.mean(), None);
        for v in [1.0, 2.0, 3.0, 4.0] {
            stats.fold(v);
        }
        assert_eq!(stats.count, 4);
        assert!((stats.mean().unwrap() - 2.5).abs() < 1e-12);
        assert!((stats.variance().unwrap() - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sequence_counter_skips_seen_values() {
        let counter = SequenceCounter::default();
        assert_eq!(counter.next(), 0);
        counter.observe(41);
        assert_eq!(counter.next(), 42);
        counter.observe(3);
        assert_eq!(counter.next(), 43);
    }

    #[test]
    fn test_comparison_key() {
        let cmp = ComparisonId::new("A", "B");
        assert_eq!(cmp.key(), "A__vs__B");
        assert!(cmp.involves(&ArmId::new("B")));
        assert!(!cmp.involves(&ArmId::new("C")));
        assert_eq!(ComparisonId::new("control_1", "a/b").key(), "control%5F1__vs__a%2Fb");
    }

    #[test]
    fn test_comparison_keys_never_collide() {
        // Raw concatenation maps both of these to "A__vs__vs__C".
        let left = ComparisonId::new("A", "vs__C");
        let right = ComparisonId::new("A__vs", "C");
        assert_ne!(left.key(), right.key());
        for key in [left.key(), right.key()] {
            assert_eq!(key.matches(COMPARISON_SEPARATOR).count(), 1);
        }
    }

    #[test]
    fn test_arm_id_validation() {
        assert!(ArmId::new("control").validate().is_ok());
        assert!(ArmId::new("green_v2.1").validate().is_ok());
        for bad in ["", ".", "..", "../x", "a\\b", "A__vs__B", "tab\there"] {
            assert!(ArmId::new(bad).validate().is_err(), "{bad:?} accepted");
        }
    }
}
