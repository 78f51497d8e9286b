//! # martingale-posteriors: Anytime-Valid A/B Testing with Frame Playback
//!
//! **Version**: 0.1.0
//!
//! Sequential inference over streaming per-arm outcomes. Each comparison keeps
//! a mixture martingale that can be checked after every observation without
//! inflating the false-positive rate, plus a discrete posterior over the
//! superiority odds that is rendered into heatmap frames at checkpoints and
//! archived for step-by-step playback.
//!
//! ## Pipeline
//!
//! ```text
//! observations ─> engine ─> checkpoint scheduler ─> frame renderer ─> archive ─> playback
//! ```
//!
//! ## Guarantees
//!
//! - **Anytime validity**: under the null, the probability that the e-value
//!   ever reaches `1 / alpha` is at most `alpha`
//! - **Determinism**: the same ordered stream yields bit-identical states
//! - **Atomic updates**: a rejected observation leaves no trace
//! - **Playback**: frames are immutable, contiguously numbered, idempotently
//!   appended
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use martingale_posteriors::archive::MemoryFrameArchive;
//! use martingale_posteriors::checkpoint::CheckpointPolicy;
//! use martingale_posteriors::config::ExperimentConfig;
//! use martingale_posteriors::observation::ComparisonId;
//! use martingale_posteriors::pipeline::Experiment;
//! use martingale_posteriors::playback::Playback;
//!
//! let archive = Arc::new(MemoryFrameArchive::new());
//! let config = ExperimentConfig::builder("banner")
//!     .arm("A")
//!     .arm("B")
//!     .checkpoint(CheckpointPolicy::Stride { every: 4 })
//!     .build()?;
//! let experiment = Experiment::new(config, Arc::clone(&archive))?;
//!
//! for (arm, value) in [("A", 1.0), ("B", 0.0), ("A", 0.0), ("B", 1.0)] {
//!     experiment.observe(arm, value)?;
//! }
//! experiment.close()?;
//!
//! let playback = Playback::new(archive);
//! let cmp = ComparisonId::new("A", "B");
//! assert_eq!(playback.count(&cmp), 1);
//! assert!(!playback.get_frame(&cmp, 0)?.summary().recommend_stop);
//! # Ok::<(), martingale_posteriors::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod observation;
pub mod pipeline;
pub mod playback;
pub mod render;
pub mod telemetry;

pub use error::{Error, Result};
