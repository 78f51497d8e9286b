//! Martingale posterior engine
//!
//! Maintains, per registered arm-pair comparison, a mixture test martingale
//! (e-process) and the posterior over the effect parameter it induces.
//!
//! ## Concurrency
//!
//! All mutation goes through one exclusive lock (single writer), so concurrent
//! `ingest` calls are serialized and each one is validated against the
//! sequence number of the last accepted observation. Readers take the shared
//! lock and receive copies, never live references.
//!
//! ## Example
//!
//! ```rust
//! use martingale_posteriors::engine::{MartingaleEngine, PriorConfig};
//! use martingale_posteriors::observation::{ComparisonId, Observation, OutcomeModel};
//!
//! let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build()?);
//! engine.register_arm("A")?;
//! engine.register_arm("B")?;
//! let cmp = engine.register_comparison("A", "B")?;
//!
//! engine.ingest(&Observation::new("A", 0.0, 0))?;
//! engine.ingest(&Observation::new("B", 1.0, 1))?;
//!
//! let state = engine.current_state(&cmp)?;
//! assert_eq!(state.sample_count(), 2);
//! assert!(state.e_value() >= 0.0);
//! # Ok::<(), martingale_posteriors::Error>(())
//! ```

mod prior;
mod state;

pub use prior::{
    DiscretePrior, EffectVariant, MixturePrior, NormalPrior, PriorConfig, PriorShape, UniformPrior,
};
pub use state::{PairCounts, PairOutcome, PosteriorState, Side};

pub(crate) use state::log_sum_exp;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::observation::{ArmId, ArmStats, ComparisonId, Observation, OutcomeModel};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct EngineInner {
    arms: FxHashMap<ArmId, ArmStats>,
    comparisons: FxHashMap<ComparisonId, PosteriorState>,
    by_arm: FxHashMap<ArmId, Vec<ComparisonId>>,
    last_sequence: Option<u64>,
    closed: bool,
}

/// Sequential, anytime-valid inference over streaming per-arm outcomes.
#[derive(Debug)]
pub struct MartingaleEngine {
    model: OutcomeModel,
    prior: MixturePrior,
    inner: RwLock<EngineInner>,
}

impl MartingaleEngine {
    /// Create an engine with no arms.
    #[must_use]
    pub fn new(model: OutcomeModel, prior: MixturePrior) -> Self {
        Self {
            model,
            prior,
            inner: RwLock::new(EngineInner::default()),
        }
    }

    // Mutation never panics between validation and commit, so a poisoned
    // lock still guards a consistent state.
    fn read(&self) -> RwLockReadGuard<'_, EngineInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outcome model observations are checked against.
    #[must_use]
    pub const fn model(&self) -> OutcomeModel {
        self.model
    }

    /// Mixture prior every comparison starts from.
    #[must_use]
    pub const fn prior(&self) -> &MixturePrior {
        &self.prior
    }

    /// Register an arm. Registering the same arm twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an id rejected by
    /// [`ArmId::validate`], and [`Error::ExperimentClosed`] after
    /// [`close`](Self::close).
    pub fn register_arm(&self, id: impl Into<ArmId>) -> Result<()> {
        let id = id.into();
        id.validate().map_err(Error::InvalidConfig)?;
        let mut inner = self.write();
        if inner.closed {
            return Err(Error::ExperimentClosed);
        }
        if inner.arms.contains_key(&id) {
            debug!(arm = %id, "arm already registered");
            return Ok(());
        }
        info!(arm = %id, "registered arm");
        inner.arms.insert(id, ArmStats::default());
        Ok(())
    }

    /// Register the comparison of `b` against baseline `a`.
    ///
    /// The comparison starts at the prior and only sees observations ingested
    /// after registration. Registering it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownArm`] when either arm is missing,
    /// [`Error::InvalidConfig`] when `a == b`, and [`Error::ExperimentClosed`]
    /// after [`close`](Self::close).
    pub fn register_comparison(
        &self,
        a: impl Into<ArmId>,
        b: impl Into<ArmId>,
    ) -> Result<ComparisonId> {
        let comparison = ComparisonId::new(a, b);
        let mut inner = self.write();
        if inner.closed {
            return Err(Error::ExperimentClosed);
        }
        for arm in [&comparison.a, &comparison.b] {
            if !inner.arms.contains_key(arm) {
                return Err(Error::UnknownArm(arm.to_string()));
            }
        }
        if comparison.a == comparison.b {
            return Err(Error::InvalidConfig(format!(
                "comparison needs two distinct arms, got {comparison}"
            )));
        }
        if inner.comparisons.contains_key(&comparison) {
            return Ok(comparison);
        }

        let state = PosteriorState::initial(comparison.clone(), &self.prior);
        inner.comparisons.insert(comparison.clone(), state);
        for arm in [&comparison.a, &comparison.b] {
            inner
                .by_arm
                .entry(arm.clone())
                .or_default()
                .push(comparison.clone());
        }
        info!(comparison = %comparison, variants = self.prior.len(), "registered comparison");
        Ok(comparison)
    }

    /// Fold one observation into its arm and every comparison involving it.
    ///
    /// # Errors
    ///
    /// See [`ingest_capturing`](Self::ingest_capturing).
    pub fn ingest(&self, observation: &Observation) -> Result<()> {
        self.ingest_capturing(observation).map(|_| ())
    }

    /// Fold one observation and return copies of every comparison state it
    /// touched, frozen at their new sample counts.
    ///
    /// Either every affected state is updated or none is.
    ///
    /// # Errors
    ///
    /// - [`Error::ExperimentClosed`] after [`close`](Self::close)
    /// - [`Error::UnknownArm`] for an unregistered arm
    /// - [`Error::InvalidObservation`] for a value outside the model support
    /// - [`Error::OrderingViolation`] when the sequence number does not exceed
    ///   the last accepted one
    pub fn ingest_capturing(&self, observation: &Observation) -> Result<Vec<PosteriorState>> {
        let mut inner = self.write();
        let arm = observation.arm();

        if inner.closed {
            return Err(Error::ExperimentClosed);
        }
        if !inner.arms.contains_key(arm) {
            warn!(arm = %arm, "observation for unregistered arm");
            return Err(Error::UnknownArm(arm.to_string()));
        }
        if let Err(reason) = self.model.check(observation.value()) {
            warn!(arm = %arm, sequence = observation.sequence(), %reason, "rejected observation");
            return Err(Error::InvalidObservation {
                arm: arm.to_string(),
                reason,
            });
        }
        if let Some(last) = inner.last_sequence {
            if observation.sequence() <= last {
                warn!(
                    arm = %arm,
                    last,
                    got = observation.sequence(),
                    "out-of-order observation"
                );
                return Err(Error::OrderingViolation {
                    last,
                    got: observation.sequence(),
                });
            }
        }

        let EngineInner {
            arms,
            comparisons,
            by_arm,
            last_sequence,
            ..
        } = &mut *inner;

        if let Some(stats) = arms.get_mut(arm) {
            stats.fold(observation.value());
        }
        *last_sequence = Some(observation.sequence());

        let touched = by_arm.get(arm).map_or(&[][..], Vec::as_slice);
        let mut snapshots = Vec::with_capacity(touched.len());
        for comparison in touched {
            let Some(state) = comparisons.get_mut(comparison) else {
                continue;
            };
            let side = if &comparison.a == arm { Side::A } else { Side::B };
            let pair = state.fold(side, observation);
            debug!(
                comparison = %comparison,
                sequence = observation.sequence(),
                sample_count = state.sample_count(),
                ?pair,
                log_e_value = state.log_martingale(),
                "folded observation"
            );
            snapshots.push(state.clone());
        }
        Ok(snapshots)
    }

    /// Immutable copy of a comparison's current state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownComparison`] if the pair was never registered.
    pub fn current_state(&self, comparison: &ComparisonId) -> Result<PosteriorState> {
        self.read()
            .comparisons
            .get(comparison)
            .cloned()
            .ok_or_else(|| Error::UnknownComparison(comparison.to_string()))
    }

    /// Copy of an arm's sufficient statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownArm`] if the arm was never registered.
    pub fn arm_stats(&self, arm: &ArmId) -> Result<ArmStats> {
        self.read()
            .arms
            .get(arm)
            .copied()
            .ok_or_else(|| Error::UnknownArm(arm.to_string()))
    }

    /// Registered comparisons in sorted order.
    #[must_use]
    pub fn comparisons(&self) -> Vec<ComparisonId> {
        let mut all: Vec<_> = self.read().comparisons.keys().cloned().collect();
        all.sort();
        all
    }

    /// Sequence number of the last accepted observation.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.read().last_sequence
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Freeze the engine and return the final state of every comparison,
    /// sorted by comparison. Calling it again returns the same states.
    pub fn close(&self) -> Vec<PosteriorState> {
        let mut inner = self.write();
        if !inner.closed {
            inner.closed = true;
            info!(
                comparisons = inner.comparisons.len(),
                last_sequence = ?inner.last_sequence,
                "engine closed"
            );
        }
        let mut finals: Vec<_> = inner.comparisons.values().cloned().collect();
        finals.sort_by(|x, y| x.comparison().cmp(y.comparison()));
        finals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (MartingaleEngine, ComparisonId) {
        let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build().unwrap());
        engine.register_arm("A").unwrap();
        engine.register_arm("B").unwrap();
        let cmp = engine.register_comparison("A", "B").unwrap();
        (engine, cmp)
    }

    #[test]
    fn test_unknown_arm_rejected() {
        let (engine, _) = engine();
        let err = engine.ingest(&Observation::new("C", 1.0, 0)).unwrap_err();
        assert!(matches!(err, Error::UnknownArm(ref arm) if arm == "C"));
        assert!(matches!(
            engine.register_comparison("A", "C"),
            Err(Error::UnknownArm(_))
        ));
    }

    #[test]
    fn test_unsafe_arm_ids_rejected() {
        let (engine, _) = engine();
        for bad in ["../escape", "A__vs__B", "", "x/y"] {
            assert!(
                matches!(engine.register_arm(bad), Err(Error::InvalidConfig(_))),
                "{bad:?} accepted"
            );
        }
        assert!(matches!(
            engine.register_comparison("A", "../escape"),
            Err(Error::UnknownArm(_))
        ));
        assert_eq!(engine.comparisons().len(), 1);
    }

    #[test]
    fn test_unknown_comparison_rejected() {
        let (engine, _) = engine();
        let err = engine.current_state(&ComparisonId::new("B", "A")).unwrap_err();
        assert!(matches!(err, Error::UnknownComparison(_)));
    }

    #[test]
    fn test_self_comparison_rejected() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.register_comparison("A", "A"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_observation_does_not_mutate() {
        let (engine, cmp) = engine();
        engine.ingest(&Observation::new("A", 1.0, 0)).unwrap();
        let before = engine.current_state(&cmp).unwrap();

        let err = engine.ingest(&Observation::new("B", 0.5, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidObservation { .. }));
        assert_eq!(engine.current_state(&cmp).unwrap(), before);
        assert_eq!(engine.arm_stats(&ArmId::new("B")).unwrap().count, 0);

        // Sequence 1 was not consumed by the rejected call.
        engine.ingest(&Observation::new("B", 0.0, 1)).unwrap();
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (engine, cmp) = engine();
        engine.ingest(&Observation::new("A", 1.0, 5)).unwrap();
        let err = engine.ingest(&Observation::new("B", 1.0, 4)).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { last: 5, got: 4 }));
        let err = engine.ingest(&Observation::new("B", 1.0, 5)).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));
        assert_eq!(engine.current_state(&cmp).unwrap().sample_count(), 1);
    }

    #[test]
    fn test_ingest_touches_every_comparison_of_the_arm() {
        let (engine, ab) = engine();
        engine.register_arm("C").unwrap();
        let ac = engine.register_comparison("A", "C").unwrap();

        let touched = engine.ingest_capturing(&Observation::new("A", 1.0, 0)).unwrap();
        assert_eq!(touched.len(), 2);
        assert_eq!(engine.current_state(&ab).unwrap().sample_count(), 1);
        assert_eq!(engine.current_state(&ac).unwrap().sample_count(), 1);

        engine.ingest(&Observation::new("C", 1.0, 1)).unwrap();
        assert_eq!(engine.current_state(&ab).unwrap().sample_count(), 1);
        assert_eq!(engine.current_state(&ac).unwrap().sample_count(), 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let (engine, cmp) = engine();
        let frozen = engine.current_state(&cmp).unwrap();
        engine.ingest(&Observation::new("A", 1.0, 0)).unwrap();
        assert_eq!(frozen.sample_count(), 0);
        assert_eq!(engine.current_state(&cmp).unwrap().sample_count(), 1);
    }

    #[test]
    fn test_close_freezes_engine() {
        let (engine, _) = engine();
        engine.ingest(&Observation::new("A", 1.0, 0)).unwrap();
        let finals = engine.close();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].sample_count(), 1);
        assert!(engine.is_closed());
        assert!(matches!(
            engine.ingest(&Observation::new("B", 1.0, 1)),
            Err(Error::ExperimentClosed)
        ));
        assert_eq!(engine.close(), finals);
    }
}
