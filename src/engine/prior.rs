//! Mixture prior over the effect parameter
//!
//! The alternative hypothesis is an explicit, enumerable set of weighted
//! variants. New prior shapes implement [`PriorShape`]; the update loop only
//! ever sees the normalized [`MixturePrior`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One alternative: an effect size (log superiority odds) and its prior weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectVariant {
    /// `psi = ln(rho)`, the log odds that B beats A in a decisive pair
    pub log_odds: f64,
    /// Prior weight (normalized by [`MixturePrior`])
    pub weight: f64,
}

impl EffectVariant {
    /// Create a variant.
    #[must_use]
    pub const fn new(log_odds: f64, weight: f64) -> Self {
        Self { log_odds, weight }
    }
}

/// Source of weighted variants.
pub trait PriorShape: Send + Sync {
    /// Short name used in logs and manifests.
    fn name(&self) -> &'static str;

    /// Unnormalized variants.
    fn variants(&self) -> Vec<EffectVariant>;
}

/// Discretized normal prior on `psi`, truncated at `mean ± 4 scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPrior {
    /// Prior mean of `psi`
    pub mean: f64,
    /// Prior standard deviation of `psi`
    pub scale: f64,
    /// Number of atoms
    pub atoms: usize,
}

const NORMAL_SPAN_SDS: f64 = 4.0;

impl PriorShape for NormalPrior {
    fn name(&self) -> &'static str {
        "normal"
    }

    #[allow(clippy::cast_precision_loss)]
    fn variants(&self) -> Vec<EffectVariant> {
        if self.atoms == 1 {
            return vec![EffectVariant::new(self.mean, 1.0)];
        }
        let lo = self.mean - NORMAL_SPAN_SDS * self.scale;
        let step = 2.0 * NORMAL_SPAN_SDS * self.scale / (self.atoms - 1) as f64;
        (0..self.atoms)
            .map(|i| {
                let psi = lo + step * i as f64;
                let z = (psi - self.mean) / self.scale;
                EffectVariant::new(psi, (-0.5 * z * z).exp())
            })
            .collect()
    }
}

/// Equal weights on an evenly spaced set of effects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformPrior {
    /// Smallest `psi`
    pub lower: f64,
    /// Largest `psi`
    pub upper: f64,
    /// Number of atoms
    pub atoms: usize,
}

impl PriorShape for UniformPrior {
    fn name(&self) -> &'static str {
        "uniform"
    }

    #[allow(clippy::cast_precision_loss)]
    fn variants(&self) -> Vec<EffectVariant> {
        if self.atoms == 1 {
            return vec![EffectVariant::new(0.5 * (self.lower + self.upper), 1.0)];
        }
        let step = (self.upper - self.lower) / (self.atoms - 1) as f64;
        (0..self.atoms)
            .map(|i| EffectVariant::new(self.lower + step * i as f64, 1.0))
            .collect()
    }
}

/// Explicit list of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscretePrior(pub Vec<EffectVariant>);

impl PriorShape for DiscretePrior {
    fn name(&self) -> &'static str {
        "discrete"
    }

    fn variants(&self) -> Vec<EffectVariant> {
        self.0.clone()
    }
}

/// Serializable prior choice used by experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PriorConfig {
    /// See [`NormalPrior`]
    Normal {
        /// Prior mean of `psi`
        mean: f64,
        /// Prior standard deviation of `psi`
        scale: f64,
        /// Number of atoms
        atoms: usize,
    },
    /// See [`UniformPrior`]
    Uniform {
        /// Smallest `psi`
        lower: f64,
        /// Largest `psi`
        upper: f64,
        /// Number of atoms
        atoms: usize,
    },
    /// See [`DiscretePrior`]
    Discrete {
        /// Explicit variants
        variants: Vec<EffectVariant>,
    },
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self::Normal {
            mean: 0.0,
            scale: 1.0,
            atoms: 41,
        }
    }
}

impl PriorConfig {
    /// Build the normalized mixture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for non-finite parameters, zero atoms,
    /// a non-positive scale or an empty/zero-weight variant list.
    pub fn build(&self) -> Result<MixturePrior> {
        match self {
            Self::Normal { mean, scale, atoms } => {
                if !(mean.is_finite() && scale.is_finite() && *scale > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "normal prior needs finite mean and positive scale, got mean={mean} scale={scale}"
                    )));
                }
                check_atoms(*atoms)?;
                MixturePrior::from_shape(&NormalPrior {
                    mean: *mean,
                    scale: *scale,
                    atoms: *atoms,
                })
            }
            Self::Uniform {
                lower,
                upper,
                atoms,
            } => {
                if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                    return Err(Error::InvalidConfig(format!(
                        "uniform prior needs finite lower < upper, got [{lower}, {upper}]"
                    )));
                }
                check_atoms(*atoms)?;
                MixturePrior::from_shape(&UniformPrior {
                    lower: *lower,
                    upper: *upper,
                    atoms: *atoms,
                })
            }
            Self::Discrete { variants } => {
                MixturePrior::from_shape(&DiscretePrior(variants.clone()))
            }
        }
    }
}

fn check_atoms(atoms: usize) -> Result<()> {
    if atoms == 0 {
        return Err(Error::InvalidConfig("prior needs at least one atom".to_string()));
    }
    Ok(())
}

/// Normalized mixture, sorted by effect with duplicate effects merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixturePrior {
    shape: String,
    variants: Vec<EffectVariant>,
}

impl MixturePrior {
    /// Normalize the variants of any shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a variant is non-finite, a weight
    /// is negative, or the total weight is zero.
    pub fn from_shape(shape: &dyn PriorShape) -> Result<Self> {
        let mut raw = shape.variants();
        if raw.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{} prior produced no variants",
                shape.name()
            )));
        }
        for v in &raw {
            if !(v.log_odds.is_finite() && v.weight.is_finite()) || v.weight < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "invalid prior variant {v:?} in {} prior",
                    shape.name()
                )));
            }
        }
        raw.sort_by(|x, y| x.log_odds.total_cmp(&y.log_odds));

        let mut variants: Vec<EffectVariant> = Vec::with_capacity(raw.len());
        for v in raw {
            match variants.last_mut() {
                Some(last) if last.log_odds == v.log_odds => last.weight += v.weight,
                _ => variants.push(v),
            }
        }
        variants.retain(|v| v.weight > 0.0);

        let total: f64 = variants.iter().map(|v| v.weight).sum();
        if variants.is_empty() || total <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "{} prior has zero total weight",
                shape.name()
            )));
        }
        for v in &mut variants {
            v.weight /= total;
        }

        Ok(Self {
            shape: shape.name().to_string(),
            variants,
        })
    }

    /// Name of the shape the mixture was built from.
    #[must_use]
    pub fn shape(&self) -> &str {
        &self.shape
    }

    /// Normalized variants in ascending effect order.
    #[must_use]
    pub fn variants(&self) -> &[EffectVariant] {
        &self.variants
    }

    /// Number of variants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Whether the mixture is empty (never true for a built mixture).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Effects in ascending order.
    #[must_use]
    pub fn effects(&self) -> Vec<f64> {
        self.variants.iter().map(|v| v.log_odds).collect()
    }

    /// Natural log of each weight.
    #[must_use]
    pub fn log_weights(&self) -> Vec<f64> {
        self.variants.iter().map(|v| v.weight.ln()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_prior_is_normalized_and_symmetric() {
        let prior = PriorConfig::default().build().unwrap();
        assert_eq!(prior.len(), 41);
        let total: f64 = prior.variants().iter().map(|v| v.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);

        let first = prior.variants()[0];
        let last = prior.variants()[40];
        assert!((first.log_odds + last.log_odds).abs() < 1e-12);
        assert!((first.weight - last.weight).abs() < 1e-15);
        assert!((prior.variants()[20].log_odds).abs() < 1e-12);
    }

    #[test]
    fn test_discrete_prior_merges_duplicates() {
        let prior = PriorConfig::Discrete {
            variants: vec![
                EffectVariant::new(1.0, 1.0),
                EffectVariant::new(-1.0, 2.0),
                EffectVariant::new(1.0, 1.0),
            ],
        }
        .build()
        .unwrap();
        assert_eq!(prior.effects(), vec![-1.0, 1.0]);
        assert!((prior.variants()[0].weight - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_priors_rejected() {
        assert!(PriorConfig::Normal {
            mean: 0.0,
            scale: 0.0,
            atoms: 5
        }
        .build()
        .is_err());
        assert!(PriorConfig::Uniform {
            lower: 1.0,
            upper: -1.0,
            atoms: 5
        }
        .build()
        .is_err());
        assert!(PriorConfig::Discrete { variants: vec![] }.build().is_err());
        assert!(PriorConfig::Discrete {
            variants: vec![EffectVariant::new(0.0, -1.0)]
        }
        .build()
        .is_err());
    }

    #[test]
    fn test_single_atom_uniform_sits_at_midpoint() {
        let prior = PriorConfig::Uniform {
            lower: -1.0,
            upper: 3.0,
            atoms: 1,
        }
        .build()
        .unwrap();
        assert_eq!(prior.effects(), vec![1.0]);
    }
}
