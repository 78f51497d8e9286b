//! Experiment configuration
//!
//! Everything that must be fixed before the first observation: outcome
//! model, prior, stopping level, checkpoint policy and grid. Loaded from JSON
//! or assembled with [`ExperimentConfig::builder`].
//!
//! ```rust
//! use martingale_posteriors::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::from_json_str(r#"{
//!     "name": "checkout-button",
//!     "arms": ["control", "green"],
//!     "alpha": 0.01,
//!     "checkpoint": { "policy": "geometric", "first": 10, "ratio": 1.5 },
//!     "grid": { "range": [0.25, 4.0], "resolution": 48, "scale": "log" }
//! }"#)?;
//! assert_eq!(config.comparison_pairs().len(), 1);
//! assert!((config.alpha - 0.01).abs() < f64::EPSILON);
//! # Ok::<(), martingale_posteriors::Error>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointPolicy;
use crate::engine::{MixturePrior, PriorConfig};
use crate::observation::{ArmId, ComparisonId, OutcomeModel};
use crate::render::{GridSpec, Representation, StoppingRule};
use crate::Result;

/// Full experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Human-readable experiment name
    pub name: String,
    /// Support of the outcome values
    pub outcome_model: OutcomeModel,
    /// Mixture prior over the effect
    pub prior: PriorConfig,
    /// False-positive level; the stopping threshold is `1 / alpha`
    pub alpha: f64,
    /// When frames are captured
    pub checkpoint: CheckpointPolicy,
    /// Rendering grid
    pub grid: GridSpec,
    /// Density or probability surface
    pub representation: Representation,
    /// Arms registered at start
    pub arms: Vec<ArmId>,
    /// Explicit `(baseline, challenger)` pairs; empty means every arm against
    /// the first one
    pub comparisons: Vec<(ArmId, ArmId)>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "experiment".to_string(),
            outcome_model: OutcomeModel::default(),
            prior: PriorConfig::default(),
            alpha: StoppingRule::default().alpha(),
            checkpoint: CheckpointPolicy::default(),
            grid: GridSpec::default(),
            representation: Representation::default(),
            arms: Vec::new(),
            comparisons: Vec::new(),
        }
    }
}

impl ExperimentConfig {
    /// Start a builder with default settings.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExperimentConfigBuilder {
        ExperimentConfigBuilder::new(name)
    }

    /// Parse and validate JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) for
    /// malformed JSON and validation errors from [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns IO errors plus everything [`from_json_str`](Self::from_json_str) returns.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Check every nested part.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) or
    /// [`Error::InvalidGridSpec`](crate::Error::InvalidGridSpec).
    pub fn validate(&self) -> Result<()> {
        self.outcome_model
            .validate()
            .map_err(crate::Error::InvalidConfig)?;
        for arm in &self.arms {
            arm.validate().map_err(crate::Error::InvalidConfig)?;
        }
        self.prior.build()?;
        self.stopping_rule()?;
        self.checkpoint.validate()?;
        self.grid.validate()?;
        Ok(())
    }

    /// Stopping rule derived from `alpha`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) unless `0 < alpha < 1`.
    pub fn stopping_rule(&self) -> Result<StoppingRule> {
        StoppingRule::new(self.alpha)
    }

    /// Built mixture prior.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) for an invalid prior.
    pub fn mixture_prior(&self) -> Result<MixturePrior> {
        self.prior.build()
    }

    /// Comparisons to register at start.
    #[must_use]
    pub fn comparison_pairs(&self) -> Vec<ComparisonId> {
        if !self.comparisons.is_empty() {
            return self
                .comparisons
                .iter()
                .map(|(a, b)| ComparisonId::new(a.clone(), b.clone()))
                .collect();
        }
        let Some((baseline, rest)) = self.arms.split_first() else {
            return Vec::new();
        };
        rest.iter()
            .filter(|arm| *arm != baseline)
            .map(|arm| ComparisonId::new(baseline.clone(), arm.clone()))
            .collect()
    }
}

/// Builder for [`ExperimentConfig`].
#[derive(Debug)]
pub struct ExperimentConfigBuilder {
    config: ExperimentConfig,
}

impl ExperimentConfigBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ExperimentConfig {
                name: name.into(),
                ..ExperimentConfig::default()
            },
        }
    }

    /// Set the outcome model.
    #[must_use]
    pub const fn outcome_model(mut self, model: OutcomeModel) -> Self {
        self.config.outcome_model = model;
        self
    }

    /// Set the prior.
    #[must_use]
    pub fn prior(mut self, prior: PriorConfig) -> Self {
        self.config.prior = prior;
        self
    }

    /// Set the false-positive level.
    #[must_use]
    pub const fn alpha(mut self, alpha: f64) -> Self {
        self.config.alpha = alpha;
        self
    }

    /// Set the checkpoint policy.
    #[must_use]
    pub const fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.config.checkpoint = policy;
        self
    }

    /// Set the rendering grid.
    #[must_use]
    pub const fn grid(mut self, grid: GridSpec) -> Self {
        self.config.grid = grid;
        self
    }

    /// Set the frame representation.
    #[must_use]
    pub const fn representation(mut self, representation: Representation) -> Self {
        self.config.representation = representation;
        self
    }

    /// Add an arm.
    #[must_use]
    pub fn arm(mut self, arm: impl Into<ArmId>) -> Self {
        self.config.arms.push(arm.into());
        self
    }

    /// Add an explicit comparison of `b` against baseline `a`.
    #[must_use]
    pub fn comparison(mut self, a: impl Into<ArmId>, b: impl Into<ArmId>) -> Self {
        self.config.comparisons.push((a.into(), b.into()));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ExperimentConfig::validate`] returns.
    pub fn build(self) -> Result<ExperimentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
