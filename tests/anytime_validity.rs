//! Anytime-validity sanity checks
//!
//! Simulates many null streams (both arms share one success rate) and counts
//! how often the running e-value ever reaches the stopping threshold. Ville's
//! inequality bounds that fraction by alpha at every sample size, however
//! often the experiment is peeked at.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use martingale_posteriors::engine::{MartingaleEngine, PriorConfig};
use martingale_posteriors::observation::{Observation, OutcomeModel};
use martingale_posteriors::render::StoppingRule;

const STREAMS: usize = 400;
const OBSERVATIONS: u64 = 400;

/// Returns whether the stream ever crossed the threshold.
fn run_stream(rng: &mut StdRng, p_a: f64, p_b: f64, rule: StoppingRule) -> bool {
    let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build().unwrap());
    engine.register_arm("A").unwrap();
    engine.register_arm("B").unwrap();
    let cmp = engine.register_comparison("A", "B").unwrap();

    for seq in 0..OBSERVATIONS {
        let (arm, p) = if seq % 2 == 0 { ("A", p_a) } else { ("B", p_b) };
        let value = if rng.gen_bool(p) { 1.0 } else { 0.0 };
        engine.ingest(&Observation::new(arm, value, seq)).unwrap();
    }
    // The running maximum covers every intermediate peek.
    rule.should_stop(&engine.current_state(&cmp).unwrap())
}

#[test]
#[allow(clippy::cast_precision_loss)]
fn test_null_streams_rarely_cross_threshold() {
    let rule = StoppingRule::new(0.05).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    for p in [0.1, 0.5, 0.8] {
        let crossed = (0..STREAMS)
            .filter(|_| run_stream(&mut rng, p, p, rule))
            .count();
        let rate = crossed as f64 / STREAMS as f64;
        assert!(rate <= 0.1, "p={p}: {crossed}/{STREAMS} null streams crossed 1/alpha");
    }
}

#[test]
#[allow(clippy::cast_precision_loss)]
fn test_real_effect_is_detected() {
    let rule = StoppingRule::new(0.05).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let crossed = (0..50)
        .filter(|_| run_stream(&mut rng, 0.2, 0.6, rule))
        .count();
    assert!(crossed >= 40, "only {crossed}/50 streams detected a large effect");
}
