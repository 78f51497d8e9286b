//! Alternating-stream walkthrough
//!
//! Runs two comparisons side by side into a directory archive, then plays the
//! frames back and writes one SVG heatmap per comparison.
//!
//! ```text
//! MPOST_LOG=debug cargo run --example alternating_stream -- /tmp/mpost
//! ```

use std::path::PathBuf;

use anyhow::Context;
use martingale_posteriors::archive::{ArchiveSettings, DirectoryFrameArchive};
use martingale_posteriors::checkpoint::CheckpointPolicy;
use martingale_posteriors::config::ExperimentConfig;
use martingale_posteriors::pipeline::Experiment;
use martingale_posteriors::playback::Playback;
use martingale_posteriors::telemetry;

fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let root = std::env::args()
        .nth(1)
        .map_or_else(|| std::env::temp_dir().join("martingale-posteriors-demo"), PathBuf::from);

    let config = ExperimentConfig::builder("alternating-stream")
        .arm("control")
        .arm("balanced")
        .arm("better")
        .alpha(0.05)
        .checkpoint(CheckpointPolicy::Stride { every: 10 })
        .build()?;
    let settings = ArchiveSettings {
        checkpoint_policy: config.checkpoint,
        grid: config.grid,
        representation: config.representation,
    };

    let archive = DirectoryFrameArchive::open(&root, settings)
        .with_context(|| format!("opening archive at {}", root.display()))?;
    let experiment = Experiment::new(config, archive)?;

    // control: 1, 0, 1, 0 ...  balanced: 0, 1, 0, 1 ...  better: 1, 1, 0, 1, 1, 0 ...
    for round in 0..100u32 {
        experiment.observe("control", f64::from(round % 2 == 0))?;
        experiment.observe("balanced", f64::from(round % 2 == 1))?;
        experiment.observe("better", f64::from(round % 3 != 2))?;
    }
    experiment.close()?;

    let playback = Playback::new(DirectoryFrameArchive::open(&root, settings)?);
    for comparison in playback.comparisons() {
        println!("{comparison}");
        for entry in playback.list_frames(&comparison) {
            let frame = playback.get_frame(&comparison, entry.frame_number)?;
            let summary = frame.summary();
            println!(
                "  frame {:>2}  n={:>3}  e={:>10.3}  p<={:.4}  P(B>A)={:.3}  next={}  stop={}",
                entry.frame_number,
                entry.sample_count,
                summary.e_value,
                summary.p_value_bound,
                summary.prob_b_superior,
                summary.leading_arm.as_ref().map_or("-", |a| a.as_str()),
                summary.recommend_stop,
            );
        }
        let svg = root.join(format!("{}.svg", comparison.key()));
        playback.heatmap(&comparison)?.write_svg(&svg, 960, 540)?;
        println!("  heatmap: {}", svg.display());
    }
    Ok(())
}
