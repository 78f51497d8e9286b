//! Frame rendering
//!
//! Turns a frozen [`PosteriorState`] into a [`Frame`]: the posterior evaluated
//! over a fixed grid of the superiority odds `rho = exp(psi)` plus scalar
//! summaries.
//!
//! The discrete mixture posterior is read as a histogram in `psi`: variant `k`
//! spreads its mass uniformly between the midpoints to its neighbours. Grid
//! cells integrate that histogram exactly, so a density frame satisfies
//! `sum(value * width) == 1` up to rounding, and a probability frame holds the
//! upper-tail probability `P(rho > rho_i)`.

mod frame;

pub use frame::{Frame, FrameSummary};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::PosteriorState;
use crate::{Error, Result};

/// Spacing of grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridScale {
    /// Evenly spaced in `rho`
    #[default]
    Linear,
    /// Evenly spaced in `ln(rho)`
    Log,
}

/// How frame values are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Probability density in `rho`; integrates to 1 over the grid
    #[default]
    Density,
    /// `P(rho > rho_i)`; each value in [0, 1]
    ProbabilitySurface,
}

/// Axis range and resolution over the superiority odds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// `(min, max)` of `rho`
    pub range: (f64, f64),
    /// Number of grid cells
    pub resolution: usize,
    /// Point spacing
    #[serde(default)]
    pub scale: GridScale,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            range: (0.25, 4.0),
            resolution: 64,
            scale: GridScale::Log,
        }
    }
}

impl GridSpec {
    /// Create a grid spec.
    #[must_use]
    pub const fn new(min: f64, max: f64, resolution: usize, scale: GridScale) -> Self {
        Self {
            range: (min, max),
            resolution,
            scale,
        }
    }

    /// Validate the spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGridSpec`] for zero resolution, non-finite
    /// bounds, `min >= max`, a negative minimum, or a log scale whose minimum
    /// is not positive.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.range;
        if self.resolution == 0 {
            return Err(Error::InvalidGridSpec("resolution must be at least 1".to_string()));
        }
        if !(min.is_finite() && max.is_finite()) {
            return Err(Error::InvalidGridSpec(format!(
                "range bounds must be finite, got ({min}, {max})"
            )));
        }
        if min >= max {
            return Err(Error::InvalidGridSpec(format!(
                "range needs min < max, got ({min}, {max})"
            )));
        }
        if min < 0.0 {
            return Err(Error::InvalidGridSpec(format!(
                "superiority odds are non-negative, got min {min}"
            )));
        }
        if self.scale == GridScale::Log && min <= 0.0 {
            return Err(Error::InvalidGridSpec(format!(
                "log scale needs a positive minimum, got {min}"
            )));
        }
        Ok(())
    }

    /// Cell edges in `rho` (`resolution + 1` values).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn edges(&self) -> Vec<f64> {
        let (min, max) = self.range;
        let n = self.resolution as f64;
        (0..=self.resolution)
            .map(|j| {
                let t = j as f64 / n;
                match self.scale {
                    GridScale::Linear => min + (max - min) * t,
                    GridScale::Log => min * (max / min).powf(t),
                }
            })
            .collect()
    }

    /// Grid points: arithmetic (linear) or geometric (log) cell centres.
    #[must_use]
    pub fn points(&self) -> Vec<f64> {
        self.edges()
            .windows(2)
            .map(|w| match self.scale {
                GridScale::Linear => 0.5 * (w[0] + w[1]),
                GridScale::Log => (w[0] * w[1]).sqrt(),
            })
            .collect()
    }
}

/// Pre-declared stopping rule: stop once the e-value reaches `1 / alpha`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoppingRule {
    alpha: f64,
}

impl Default for StoppingRule {
    fn default() -> Self {
        Self { alpha: 0.05 }
    }
}

impl StoppingRule {
    /// Rule with false-positive level `alpha`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] unless `0 < alpha < 1`.
    pub fn new(alpha: f64) -> Result<Self> {
        let rule = Self { alpha };
        rule.validate()?;
        Ok(rule)
    }

    /// Check `0 < alpha < 1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.alpha > 0.0 && self.alpha < 1.0 {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "alpha must lie in (0, 1), got {}",
                self.alpha
            )))
        }
    }

    /// False-positive level.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// E-value threshold `1 / alpha`.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        1.0 / self.alpha
    }

    /// Whether the running maximum of the e-process has crossed the threshold.
    #[must_use]
    pub fn should_stop(&self, state: &PosteriorState) -> bool {
        state.max_log_martingale() >= -self.alpha.ln()
    }
}

/// Renders frozen states into frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameRenderer {
    stopping: StoppingRule,
    representation: Representation,
}

/// Mass of one variant spread over `[lo, hi]` in `psi` (a point when equal).
#[derive(Debug, Clone, Copy)]
struct Atom {
    lo: f64,
    hi: f64,
    mass: f64,
}

impl Atom {
    fn mass_within(&self, lo: f64, hi: f64) -> f64 {
        if self.hi > self.lo {
            let overlap = self.hi.min(hi) - self.lo.max(lo);
            self.mass * (overlap.max(0.0) / (self.hi - self.lo))
        } else {
            0.0
        }
    }

    fn mass_above(&self, x: f64) -> f64 {
        if self.hi > self.lo {
            self.mass * ((self.hi - x.max(self.lo)) / (self.hi - self.lo)).clamp(0.0, 1.0)
        } else if self.lo > x {
            self.mass
        } else {
            0.0
        }
    }
}

fn atoms(state: &PosteriorState) -> Vec<Atom> {
    let effects = state.effects();
    let weights = state.posterior_weights();
    let k = effects.len();
    (0..k)
        .map(|i| {
            let (lo, hi) = if k == 1 {
                (effects[0], effects[0])
            } else {
                let lo = if i == 0 {
                    effects[0] - 0.5 * (effects[1] - effects[0])
                } else {
                    0.5 * (effects[i - 1] + effects[i])
                };
                let hi = if i == k - 1 {
                    effects[k - 1] + 0.5 * (effects[k - 1] - effects[k - 2])
                } else {
                    0.5 * (effects[i] + effects[i + 1])
                };
                (lo, hi)
            };
            Atom {
                lo,
                hi,
                mass: weights[i],
            }
        })
        .collect()
}

/// Index of the cell whose `psi` interval contains `x`, clamped to the grid.
fn cell_containing(log_edges: &[f64], x: f64) -> usize {
    let cells = log_edges.len() - 1;
    (0..cells)
        .find(|&i| x < log_edges[i + 1])
        .unwrap_or(cells - 1)
}

impl FrameRenderer {
    /// Renderer with a fixed stopping rule.
    #[must_use]
    pub const fn new(stopping: StoppingRule, representation: Representation) -> Self {
        Self {
            stopping,
            representation,
        }
    }

    /// Stopping rule fixed at construction.
    #[must_use]
    pub const fn stopping_rule(&self) -> StoppingRule {
        self.stopping
    }

    /// Representation every frame is rendered in.
    #[must_use]
    pub const fn representation(&self) -> Representation {
        self.representation
    }

    /// Render `state` over `grid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGridSpec`] if the grid fails validation; no
    /// frame is produced.
    pub fn render(&self, state: &PosteriorState, grid: &GridSpec) -> Result<Frame> {
        grid.validate()?;

        let edges = grid.edges();
        let log_edges: Vec<f64> = edges.iter().map(|e| e.ln()).collect();
        let widths: Vec<f64> = edges.windows(2).map(|w| w[1] - w[0]).collect();
        let atoms = atoms(state);

        let values = match self.representation {
            Representation::Density => Self::density(state, &atoms, &log_edges, &widths),
            Representation::ProbabilitySurface => grid
                .points()
                .iter()
                .map(|rho| {
                    let x = rho.ln();
                    atoms.iter().map(|a| a.mass_above(x)).sum::<f64>().clamp(0.0, 1.0)
                })
                .collect(),
        };

        let summary = self.summarize(state);
        debug!(
            comparison = %state.comparison(),
            sample_count = state.sample_count(),
            e_value = summary.e_value,
            recommend_stop = summary.recommend_stop,
            "rendered frame"
        );

        Ok(Frame {
            comparison: state.comparison().clone(),
            sample_count: state.sample_count(),
            captured_at: state.last_observed_at().unwrap_or_default(),
            representation: self.representation,
            grid: *grid,
            axis: grid.points(),
            widths,
            values,
            summary,
        })
    }

    fn density(
        state: &PosteriorState,
        atoms: &[Atom],
        log_edges: &[f64],
        widths: &[f64],
    ) -> Vec<f64> {
        let cells = widths.len();
        let mut masses = vec![0.0; cells];
        for atom in atoms {
            if atom.hi > atom.lo {
                for (i, mass) in masses.iter_mut().enumerate() {
                    *mass += atom.mass_within(log_edges[i], log_edges[i + 1]);
                }
            } else if atom.lo >= log_edges[0] && atom.lo <= log_edges[cells] {
                masses[cell_containing(log_edges, atom.lo)] += atom.mass;
            }
        }

        let total: f64 = masses.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            // Posterior support lies outside the grid: collapse onto the cell
            // nearest the posterior mean.
            masses = vec![0.0; cells];
            masses[cell_containing(log_edges, state.posterior_mean_log_odds())] = 1.0;
        } else {
            for mass in &mut masses {
                *mass /= total;
            }
        }

        masses.iter().zip(widths).map(|(m, w)| m / w).collect()
    }

    fn summarize(&self, state: &PosteriorState) -> FrameSummary {
        let prob_b_superior = state.prob_b_superior();
        let leading_arm = if prob_b_superior > 0.5 + 1e-12 {
            Some(state.comparison().b.clone())
        } else if prob_b_superior < 0.5 - 1e-12 {
            Some(state.comparison().a.clone())
        } else {
            None
        };
        FrameSummary {
            e_value: state.e_value(),
            log_e_value: state.log_martingale(),
            max_log_e_value: state.max_log_martingale(),
            p_value_bound: state.p_value_bound(),
            threshold: self.stopping.threshold(),
            recommend_stop: self.stopping.should_stop(state),
            prob_b_superior,
            posterior_mean_log_odds: state.posterior_mean_log_odds(),
            leading_arm,
            pairs: state.pairs(),
            unpaired: state.pending() as u64,
        }
    }
}
