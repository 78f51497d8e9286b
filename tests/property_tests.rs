//! Property-based tests for martingale-posteriors
//!
//! - Test mathematical invariants of the e-process and the rendered frames
//! - Test replay determinism and ordering rules
//! - Run with ProptestConfig::with_cases(100)

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use quickcheck::{quickcheck, TestResult};

use martingale_posteriors::engine::{MartingaleEngine, PosteriorState, PriorConfig};
use martingale_posteriors::observation::{ComparisonId, Observation, OutcomeModel};
use martingale_posteriors::render::{FrameRenderer, GridScale, GridSpec, Representation, StoppingRule};
use martingale_posteriors::Error;

// ============================================================================
// Helpers
// ============================================================================

fn engine() -> (MartingaleEngine, ComparisonId) {
    let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build().unwrap());
    engine.register_arm("A").unwrap();
    engine.register_arm("B").unwrap();
    let cmp = engine.register_comparison("A", "B").unwrap();
    (engine, cmp)
}

/// Feed `(is_b, success)` pairs in order and return every intermediate state.
/// Arrival times are derived from the sequence number so replays match exactly.
fn replay(stream: &[(bool, bool)]) -> Vec<PosteriorState> {
    let (engine, cmp) = engine();
    stream
        .iter()
        .enumerate()
        .map(|(seq, &(is_b, success))| {
            let arm = if is_b { "B" } else { "A" };
            let at = Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap();
            engine
                .ingest(&Observation::at(arm, f64::from(u8::from(success)), seq as u64, at))
                .unwrap();
            engine.current_state(&cmp).unwrap()
        })
        .collect()
}

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Stream of `(is_b, success)` outcomes
fn arb_stream(max_len: usize) -> impl Strategy<Value = Vec<(bool, bool)>> {
    proptest::collection::vec((any::<bool>(), any::<bool>()), 1..max_len)
}

/// Valid grid over the superiority odds
fn arb_grid() -> impl Strategy<Value = GridSpec> {
    (0.05f64..1.0, 1.0f64..20.0, 1usize..96, any::<bool>()).prop_map(|(min, max, res, log)| {
        let scale = if log { GridScale::Log } else { GridScale::Linear };
        GridSpec::new(min, max + 0.01, res, scale)
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the mixture martingale is positive and finite
    #[test]
    fn prop_martingale_positive_and_finite(stream in arb_stream(200)) {
        for state in replay(&stream) {
            prop_assert!(state.log_martingale().is_finite());
            prop_assert!(state.e_value() > 0.0);
            prop_assert!(state.max_log_martingale() >= state.log_martingale());
            prop_assert!(state.max_log_martingale() >= 0.0);
        }
    }

    /// Property: the posterior stays a probability distribution
    #[test]
    fn prop_posterior_normalized(stream in arb_stream(200)) {
        let last = replay(&stream).pop().unwrap();
        let total: f64 = last.posterior_weights().iter().sum();
        prop_assert!((total - 1.0).abs() < 1e-9, "posterior mass {}", total);
        prop_assert!((0.0..=1.0).contains(&last.prob_b_superior()));
    }

    /// Property: p-value bound is non-increasing and within [0, 1]
    #[test]
    fn prop_p_value_bound_non_increasing(stream in arb_stream(200)) {
        let bounds: Vec<f64> = replay(&stream).iter().map(PosteriorState::p_value_bound).collect();
        for window in bounds.windows(2) {
            prop_assert!(window[1] <= window[0]);
        }
        prop_assert!(bounds.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    /// Property: a stop recommendation is never withdrawn
    #[test]
    fn prop_stop_is_sticky(stream in arb_stream(200)) {
        let rule = StoppingRule::new(0.2).unwrap();
        let decisions: Vec<bool> = replay(&stream).iter().map(|s| rule.should_stop(s)).collect();
        if let Some(first) = decisions.iter().position(|&d| d) {
            prop_assert!(decisions[first..].iter().all(|&d| d));
        }
    }

    /// Property: density frames integrate to 1 on any valid grid
    #[test]
    fn prop_density_integrates_to_one(stream in arb_stream(120), grid in arb_grid()) {
        let state = replay(&stream).pop().unwrap();
        let frame = FrameRenderer::default().render(&state, &grid).unwrap();
        prop_assert_eq!(frame.values().len(), grid.resolution);
        prop_assert!(frame.values().iter().all(|v| *v >= 0.0 && v.is_finite()));
        prop_assert!((frame.integral() - 1.0).abs() < 1e-6, "integral {}", frame.integral());
    }

    /// Property: probability surfaces are non-increasing along the axis
    #[test]
    fn prop_probability_surface_monotone(stream in arb_stream(120), grid in arb_grid()) {
        let state = replay(&stream).pop().unwrap();
        let renderer = FrameRenderer::new(StoppingRule::default(), Representation::ProbabilitySurface);
        let frame = renderer.render(&state, &grid).unwrap();
        for window in frame.values().windows(2) {
            prop_assert!(window[1] <= window[0] + 1e-12);
        }
        prop_assert!(frame.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    /// Property: rejected out-of-order observations change nothing
    #[test]
    fn prop_out_of_order_rejected_atomically(stream in arb_stream(50), back in 0u64..50) {
        let (engine, cmp) = engine();
        for (seq, &(is_b, success)) in stream.iter().enumerate() {
            let arm = if is_b { "B" } else { "A" };
            engine.ingest(&Observation::new(arm, f64::from(u8::from(success)), seq as u64)).unwrap();
        }
        let before = engine.current_state(&cmp).unwrap();
        let last = stream.len() as u64 - 1;
        let stale = last.saturating_sub(back);
        let result = engine.ingest(&Observation::new("B", 1.0, stale));
        let is_violation = matches!(result, Err(Error::OrderingViolation { .. }));
        prop_assert!(is_violation);
        prop_assert_eq!(engine.current_state(&cmp).unwrap(), before);
    }
}

// ============================================================================
// QuickCheck: replay determinism
// ============================================================================

quickcheck! {
    fn qc_replay_is_bit_identical(stream: Vec<(bool, bool)>) -> TestResult {
        if stream.is_empty() || stream.len() > 300 {
            return TestResult::discard();
        }
        let first = replay(&stream);
        let second = replay(&stream);
        let identical = first.iter().zip(&second).all(|(a, b)| {
            a == b
                && a.log_martingale().to_bits() == b.log_martingale().to_bits()
                && a.log_posterior()
                    .iter()
                    .zip(b.log_posterior())
                    .all(|(x, y)| x.to_bits() == y.to_bits())
        });
        TestResult::from_bool(identical)
    }
}
