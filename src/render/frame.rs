//! Frame - immutable snapshot of a comparison at one sample count

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{GridSpec, Representation};
use crate::engine::PairCounts;
use crate::observation::{ArmId, ComparisonId};

/// Scalar summaries shown next to the heatmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    /// Running e-value
    pub e_value: f64,
    /// Running log e-value
    pub log_e_value: f64,
    /// Largest log e-value seen so far
    pub max_log_e_value: f64,
    /// Anytime-valid bound on the false-positive probability
    pub p_value_bound: f64,
    /// Stopping threshold fixed at configuration time
    pub threshold: f64,
    /// Whether the e-value has reached the threshold
    pub recommend_stop: bool,
    /// Posterior probability that B beats A in a decisive pair
    pub prob_b_superior: f64,
    /// Posterior mean of the log superiority odds
    pub posterior_mean_log_odds: f64,
    /// Arm the next allocation would favour, if any
    pub leading_arm: Option<ArmId>,
    /// Completed pair counts
    pub pairs: PairCounts,
    /// Observations still waiting for a partner on the other arm
    #[serde(default)]
    pub unpaired: u64,
}

/// Rendered posterior plus scalar summaries. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub(super) comparison: ComparisonId,
    pub(super) sample_count: u64,
    pub(super) captured_at: DateTime<Utc>,
    pub(super) representation: Representation,
    pub(super) grid: GridSpec,
    pub(super) axis: Vec<f64>,
    pub(super) widths: Vec<f64>,
    pub(super) values: Vec<f64>,
    pub(super) summary: FrameSummary,
}

impl Frame {
    /// Comparison the frame belongs to.
    #[must_use]
    pub const fn comparison(&self) -> &ComparisonId {
        &self.comparison
    }

    /// Sample count at capture time.
    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Arrival time of the last observation folded into the captured state.
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// How [`values`](Self::values) are to be read.
    #[must_use]
    pub const fn representation(&self) -> Representation {
        self.representation
    }

    /// Grid the frame was rendered on.
    #[must_use]
    pub const fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Grid points (superiority odds).
    #[must_use]
    pub fn axis(&self) -> &[f64] {
        &self.axis
    }

    /// Width of the cell around each grid point.
    #[must_use]
    pub fn widths(&self) -> &[f64] {
        &self.widths
    }

    /// Density or probability value at each grid point.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Scalar summaries.
    #[must_use]
    pub const fn summary(&self) -> &FrameSummary {
        &self.summary
    }

    /// `sum(value * width)`; 1 for a density frame.
    #[must_use]
    pub fn integral(&self) -> f64 {
        self.values
            .iter()
            .zip(&self.widths)
            .map(|(v, w)| v * w)
            .sum()
    }
}
