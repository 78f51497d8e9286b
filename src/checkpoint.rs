//! Checkpoint scheduling
//!
//! Decides at which sample counts a comparison's state is captured as a
//! frame. Decisions are pure functions of `(comparison, tick)`, so replaying
//! an observation log reproduces the same checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::PosteriorState;
use crate::observation::ComparisonId;
use crate::{Error, Result};

/// Inputs to one checkpoint decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTick {
    /// Observations folded into the comparison so far
    pub sample_count: u64,
    /// Arrival time of the observation that produced this count
    pub observed_at: Option<DateTime<Utc>>,
    /// Arrival time of the observation before it
    pub previous_observed_at: Option<DateTime<Utc>>,
}

impl CheckpointTick {
    /// Tick describing a frozen state.
    #[must_use]
    pub const fn from_state(state: &PosteriorState) -> Self {
        Self {
            sample_count: state.sample_count(),
            observed_at: state.last_observed_at(),
            previous_observed_at: state.previous_observed_at(),
        }
    }

    /// Tick carrying only a sample count.
    #[must_use]
    pub const fn count(sample_count: u64) -> Self {
        Self {
            sample_count,
            observed_at: None,
            previous_observed_at: None,
        }
    }
}

/// Pluggable checkpoint policy.
pub trait CheckpointSchedule: Send + Sync {
    /// Whether the state at `tick` should become a frame.
    fn should_checkpoint(&self, comparison: &ComparisonId, tick: &CheckpointTick) -> bool;
}

/// Built-in checkpoint policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Every `every` observations.
    Stride {
        /// Observations between frames
        every: u64,
    },
    /// Log-spaced: dense early, sparse later.
    Geometric {
        /// First checkpoint
        first: u64,
        /// Growth factor between checkpoints (> 1)
        ratio: f64,
    },
    /// Whenever an observation lands in a later wall-clock bucket than the
    /// previous one.
    WallClock {
        /// Bucket width in milliseconds
        interval_ms: u64,
    },
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::Stride { every: 10 }
    }
}

impl CheckpointPolicy {
    /// Validate policy parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero stride, a zero first
    /// checkpoint, a ratio that is not finite and greater than 1, or a zero
    /// interval.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Stride { every: 0 } => {
                Err(Error::InvalidConfig("stride must be at least 1".to_string()))
            }
            Self::Geometric { first: 0, .. } => Err(Error::InvalidConfig(
                "geometric schedule must start at 1 or later".to_string(),
            )),
            Self::Geometric { ratio, .. } if !(ratio.is_finite() && ratio > 1.0) => Err(
                Error::InvalidConfig(format!("geometric ratio must exceed 1, got {ratio}")),
            ),
            Self::WallClock { interval_ms: 0 } => Err(Error::InvalidConfig(
                "wall-clock interval must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Checkpoint counts of a geometric schedule up to and including `limit`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_sign_loss)]
    pub fn geometric_points(first: u64, ratio: f64, limit: u64) -> Vec<u64> {
        let mut points = Vec::new();
        let mut previous: Option<u64> = None;
        let mut exponent: i32 = 0;
        loop {
            let raw = (first as f64 * ratio.powi(exponent)).ceil();
            let next = match previous {
                Some(p) => (raw as u64).max(p + 1),
                None => first,
            };
            if next > limit || !raw.is_finite() {
                break;
            }
            points.push(next);
            previous = Some(next);
            exponent = exponent.saturating_add(1);
        }
        points
    }

    fn on_geometric(first: u64, ratio: f64, n: u64) -> bool {
        Self::geometric_points(first, ratio, n).last() == Some(&n)
    }
}

impl CheckpointSchedule for CheckpointPolicy {
    fn should_checkpoint(&self, _comparison: &ComparisonId, tick: &CheckpointTick) -> bool {
        if tick.sample_count == 0 {
            return false;
        }
        match *self {
            Self::Stride { every } => every > 0 && tick.sample_count % every == 0,
            Self::Geometric { first, ratio } => {
                first > 0 && ratio > 1.0 && Self::on_geometric(first, ratio, tick.sample_count)
            }
            Self::WallClock { interval_ms } => {
                let (Some(now), Some(prev)) = (tick.observed_at, tick.previous_observed_at) else {
                    return false;
                };
                let width = i64::try_from(interval_ms).unwrap_or(i64::MAX).max(1);
                now.timestamp_millis().div_euclid(width) > prev.timestamp_millis().div_euclid(width)
            }
        }
    }
}

/// Policy plus the terminal-frame guarantee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointScheduler<P = CheckpointPolicy> {
    policy: P,
}

impl<P: CheckpointSchedule> CheckpointScheduler<P> {
    /// Wrap a policy.
    pub const fn new(policy: P) -> Self {
        Self { policy }
    }

    /// Borrow the wrapped policy.
    pub const fn policy(&self) -> &P {
        &self.policy
    }

    /// Decision for a regular (non-terminal) state.
    pub fn should_checkpoint(&self, comparison: &ComparisonId, tick: &CheckpointTick) -> bool {
        self.policy.should_checkpoint(comparison, tick)
    }

    /// Decision for a state that may be the last one of a closed experiment.
    /// A terminal state with at least one observation always checkpoints.
    pub fn should_checkpoint_closing(
        &self,
        comparison: &ComparisonId,
        tick: &CheckpointTick,
        closing: bool,
    ) -> bool {
        (closing && tick.sample_count > 0) || self.should_checkpoint(comparison, tick)
    }
}
