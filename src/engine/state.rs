//! Per-comparison posterior state and the log-space fold
//!
//! ## Construction
//!
//! The i-th outcome of arm A is paired with the i-th outcome of arm B. If both
//! arms share one outcome distribution the pair is exchangeable, so given it is
//! not tied, B wins with probability exactly 1/2 whatever that distribution is.
//! Each variant `psi_k` of the mixture prior predicts `sigmoid(psi_k)` instead,
//! giving the likelihood ratio `2 * sigmoid(±psi_k)`. The mixture is folded in
//! predictive form:
//!
//! ```text
//! inc      = logsumexp_k(log_pi_k + l_k)
//! log_M   += inc
//! log_pi_k = log_pi_k + l_k - inc
//! ```
//!
//! so `M` is a nonnegative test martingale under the null and `pi` is the
//! posterior over `psi`. Ties contribute a factor of one.

use std::collections::VecDeque;
use std::f64::consts::LN_2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prior::MixturePrior;
use crate::observation::{ComparisonId, Observation};

/// Which side of a comparison an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Baseline arm
    A,
    /// Challenger arm
    B,
}

/// Outcome of one completed pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairOutcome {
    /// Challenger outcome strictly greater
    BWins,
    /// Baseline outcome strictly greater
    AWins,
    /// Equal outcomes
    Tie,
}

impl PairOutcome {
    // Numeric comparison: `-0.0` and `0.0` tie. Ingested values are finite.
    fn resolve(a: f64, b: f64) -> Self {
        match b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Greater => Self::BWins,
            std::cmp::Ordering::Less => Self::AWins,
            std::cmp::Ordering::Equal => Self::Tie,
        }
    }
}

/// Counts of completed pairs by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairCounts {
    /// Pairs the challenger won
    pub b_wins: u64,
    /// Pairs the baseline won
    pub a_wins: u64,
    /// Tied pairs
    pub ties: u64,
}

impl PairCounts {
    /// Total completed pairs.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.b_wins + self.a_wins + self.ties
    }

    /// Pairs that carried evidence.
    #[must_use]
    pub const fn decisive(&self) -> u64 {
        self.b_wins + self.a_wins
    }
}

/// Running state of one arm-pair comparison.
///
/// Folding observation `n` depends only on the state after `n - 1` and that
/// observation, so replaying a log from [`PosteriorState::initial`] yields a
/// bit-identical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorState {
    comparison: ComparisonId,
    sample_count: u64,
    pairs: PairCounts,
    pending_a: VecDeque<f64>,
    pending_b: VecDeque<f64>,
    effects: Vec<f64>,
    log_posterior: Vec<f64>,
    log_martingale: f64,
    max_log_martingale: f64,
    last_sequence: Option<u64>,
    last_observed_at: Option<DateTime<Utc>>,
    previous_observed_at: Option<DateTime<Utc>>,
}

impl PosteriorState {
    /// State at the prior: martingale 1 (log 0), posterior equal to the prior.
    #[must_use]
    pub fn initial(comparison: ComparisonId, prior: &MixturePrior) -> Self {
        Self {
            comparison,
            sample_count: 0,
            pairs: PairCounts::default(),
            pending_a: VecDeque::new(),
            pending_b: VecDeque::new(),
            effects: prior.effects(),
            log_posterior: prior.log_weights(),
            log_martingale: 0.0,
            max_log_martingale: 0.0,
            last_sequence: None,
            last_observed_at: None,
            previous_observed_at: None,
        }
    }

    /// Fold one already-validated observation into the state.
    ///
    /// Returns the pair it completed, if any.
    pub(crate) fn fold(&mut self, side: Side, observation: &Observation) -> Option<PairOutcome> {
        let value = observation.value();
        let (own, other) = match side {
            Side::A => (&mut self.pending_a, &mut self.pending_b),
            Side::B => (&mut self.pending_b, &mut self.pending_a),
        };
        let outcome = match other.pop_front() {
            Some(partner) => Some(match side {
                Side::A => PairOutcome::resolve(value, partner),
                Side::B => PairOutcome::resolve(partner, value),
            }),
            None => {
                own.push_back(value);
                None
            }
        };

        if let Some(outcome) = outcome {
            self.apply_pair(outcome);
        }

        self.sample_count += 1;
        self.last_sequence = Some(observation.sequence());
        self.previous_observed_at = self.last_observed_at;
        self.last_observed_at = Some(observation.observed_at());
        outcome
    }

    fn apply_pair(&mut self, outcome: PairOutcome) {
        let sign = match outcome {
            PairOutcome::BWins => {
                self.pairs.b_wins += 1;
                1.0
            }
            PairOutcome::AWins => {
                self.pairs.a_wins += 1;
                -1.0
            }
            PairOutcome::Tie => {
                self.pairs.ties += 1;
                return;
            }
        };

        let log_lr: Vec<f64> = self
            .effects
            .iter()
            .map(|psi| LN_2 + log_sigmoid(sign * psi))
            .collect();
        let joint: Vec<f64> = self
            .log_posterior
            .iter()
            .zip(&log_lr)
            .map(|(lp, l)| lp + l)
            .collect();
        let increment = log_sum_exp(&joint);

        for (lp, j) in self.log_posterior.iter_mut().zip(&joint) {
            *lp = j - increment;
        }
        self.log_martingale += increment;
        self.max_log_martingale = self.max_log_martingale.max(self.log_martingale);
    }

    /// Comparison this state belongs to.
    #[must_use]
    pub const fn comparison(&self) -> &ComparisonId {
        &self.comparison
    }

    /// Observations from either arm folded in.
    #[must_use]
    pub const fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Completed pair counts.
    #[must_use]
    pub const fn pairs(&self) -> PairCounts {
        self.pairs
    }

    /// Observations waiting for a partner on the other arm.
    ///
    /// The queue is unbounded: when one arm runs ahead, its surplus waits here
    /// and is copied into every snapshot the engine hands out, so a long
    /// lopsided stream makes checkpoints proportionally more expensive.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending_a.len() + self.pending_b.len()
    }

    /// Effects (`psi`) of the mixture variants, ascending.
    #[must_use]
    pub fn effects(&self) -> &[f64] {
        &self.effects
    }

    /// Log posterior weight of each variant (normalized).
    #[must_use]
    pub fn log_posterior(&self) -> &[f64] {
        &self.log_posterior
    }

    /// Posterior weight of each variant in linear scale.
    #[must_use]
    pub fn posterior_weights(&self) -> Vec<f64> {
        let norm = log_sum_exp(&self.log_posterior);
        self.log_posterior.iter().map(|lp| (lp - norm).exp()).collect()
    }

    /// Running log e-value.
    #[must_use]
    pub const fn log_martingale(&self) -> f64 {
        self.log_martingale
    }

    /// Largest log e-value seen so far.
    #[must_use]
    pub const fn max_log_martingale(&self) -> f64 {
        self.max_log_martingale
    }

    /// Running e-value in linear scale (display only). Saturates at
    /// `f64::MAX` so it always serializes as a number; use
    /// [`log_martingale`](Self::log_martingale) for the exact evidence.
    #[must_use]
    pub fn e_value(&self) -> f64 {
        self.log_martingale.exp().min(f64::MAX)
    }

    /// Anytime-valid bound on the false-positive probability, by Ville's
    /// inequality applied to the running maximum.
    #[must_use]
    pub fn p_value_bound(&self) -> f64 {
        (-self.max_log_martingale).exp().min(1.0)
    }

    /// Posterior probability that B beats A in a decisive pair
    /// (mass on `psi > 0` plus half the mass at exactly zero).
    #[must_use]
    pub fn prob_b_superior(&self) -> f64 {
        self.effects
            .iter()
            .zip(self.posterior_weights())
            .map(|(psi, w)| match psi.total_cmp(&0.0) {
                std::cmp::Ordering::Greater => w,
                std::cmp::Ordering::Equal => 0.5 * w,
                std::cmp::Ordering::Less => 0.0,
            })
            .sum()
    }

    /// Posterior mean of `psi`.
    #[must_use]
    pub fn posterior_mean_log_odds(&self) -> f64 {
        self.effects
            .iter()
            .zip(self.posterior_weights())
            .map(|(psi, w)| psi * w)
            .sum()
    }

    /// Sequence number of the last folded observation.
    #[must_use]
    pub const fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Arrival time of the last folded observation.
    #[must_use]
    pub const fn last_observed_at(&self) -> Option<DateTime<Utc>> {
        self.last_observed_at
    }

    /// Arrival time of the observation before the last one.
    #[must_use]
    pub const fn previous_observed_at(&self) -> Option<DateTime<Utc>> {
        self.previous_observed_at
    }
}

/// `ln(sigmoid(x))` without overflow.
pub(crate) fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// `ln(sum(exp(xs)))` shifted by the maximum.
pub(crate) fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::prior::{EffectVariant, PriorConfig};

    fn two_point_state() -> PosteriorState {
        let prior = PriorConfig::Discrete {
            variants: vec![EffectVariant::new(-1.0, 1.0), EffectVariant::new(1.0, 1.0)],
        }
        .build()
        .unwrap();
        PosteriorState::initial(ComparisonId::new("A", "B"), &prior)
    }

    #[test]
    fn test_initial_state_is_at_prior() {
        let state = two_point_state();
        assert_eq!(state.log_martingale(), 0.0);
        assert!((state.e_value() - 1.0).abs() < f64::EPSILON);
        assert!((state.p_value_bound() - 1.0).abs() < f64::EPSILON);
        assert!((state.prob_b_superior() - 0.5).abs() < 1e-12);
        assert_eq!(state.sample_count(), 0);
    }

    #[test]
    fn test_unpaired_observation_waits() {
        let mut state = two_point_state();
        let outcome = state.fold(Side::A, &Observation::new("A", 1.0, 0));
        assert_eq!(outcome, None);
        assert_eq!(state.pending(), 1);
        assert_eq!(state.sample_count(), 1);
        assert_eq!(state.log_martingale(), 0.0);
    }

    #[test]
    fn test_b_win_matches_closed_form() {
        let mut state = two_point_state();
        state.fold(Side::A, &Observation::new("A", 0.0, 0));
        let outcome = state.fold(Side::B, &Observation::new("B", 1.0, 1));
        assert_eq!(outcome, Some(PairOutcome::BWins));

        // M = 0.5 * 2σ(-1) + 0.5 * 2σ(1) = σ(-1) + σ(1) = 1
        assert!(state.log_martingale().abs() < 1e-12);
        let sigma = 1.0 / (1.0 + (-1.0f64).exp());
        assert!((state.prob_b_superior() - sigma).abs() < 1e-12);
    }

    #[test]
    fn test_tie_leaves_evidence_unchanged() {
        let mut state = two_point_state();
        state.fold(Side::B, &Observation::new("B", 1.0, 0));
        let before = state.log_posterior().to_vec();
        assert_eq!(state.fold(Side::A, &Observation::new("A", 1.0, 1)), Some(PairOutcome::Tie));
        assert_eq!(state.log_posterior(), before.as_slice());
        assert_eq!(state.pairs().ties, 1);
    }

    #[test]
    fn test_signed_zeros_tie() {
        let mut state = two_point_state();
        state.fold(Side::A, &Observation::new("A", 0.0, 0));
        let outcome = state.fold(Side::B, &Observation::new("B", -0.0, 1));
        assert_eq!(outcome, Some(PairOutcome::Tie));
        assert_eq!(state.log_martingale(), 0.0);
        assert_eq!(state.pairs().a_wins, 0);
        assert_eq!(state.pairs().ties, 1);
    }

    #[test]
    fn test_e_value_saturates() {
        let mut state = two_point_state();
        for i in 0..2_500u64 {
            state.fold(Side::A, &Observation::new("A", 0.0, 2 * i));
            state.fold(Side::B, &Observation::new("B", 1.0, 2 * i + 1));
        }
        assert!(state.log_martingale() > 709.0);
        assert_eq!(state.e_value(), f64::MAX);
        assert!(state.p_value_bound() >= 0.0);
    }

    #[test]
    fn test_log_helpers() {
        assert!((log_sigmoid(0.0) + LN_2).abs() < 1e-15);
        assert!(log_sigmoid(-800.0).is_finite());
        assert!((log_sum_exp(&[0.0, 0.0]) - LN_2).abs() < 1e-15);
        assert!((log_sum_exp(&[1000.0, 1000.0]) - (1000.0 + LN_2)).abs() < 1e-9);
    }
}
