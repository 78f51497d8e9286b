//! Experiment pipeline
//!
//! ```text
//! observe ──> MartingaleEngine ──> CheckpointScheduler ──> FrameRenderer ──> FrameSink
//!             (exclusive lock)      (pure decision)         (pure)            (archive / queue)
//! ```
//!
//! The engine hands back frozen copies of every state an observation touched,
//! so rendering never holds the engine lock and readers of
//! [`MartingaleEngine::current_state`] are never blocked by it.
//!
//! Rendered frames go through a backlog. A frame the sink refuses stays queued,
//! together with every later frame of its comparison, and is retried on the
//! next observation or [`Experiment::flush`]. Other comparisons keep flowing.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::archive::FrameSink;
use crate::checkpoint::{CheckpointScheduler, CheckpointTick};
use crate::config::ExperimentConfig;
use crate::engine::{MartingaleEngine, PosteriorState};
use crate::observation::{ArmId, ComparisonId, Observation, SequenceCounter};
use crate::render::{Frame, FrameRenderer, StoppingRule};
use crate::{Error, Result};

/// A running experiment: engine, checkpoint policy, renderer and frame sink.
pub struct Experiment {
    config: ExperimentConfig,
    engine: MartingaleEngine,
    scheduler: CheckpointScheduler,
    renderer: FrameRenderer,
    sink: Box<dyn FrameSink>,
    sequence: SequenceCounter,
    // Serializes sequence assignment, folding and frame submission so frames
    // reach the sink in sample-count order.
    intake: Mutex<()>,
    // Frames not yet accepted by the sink, in render order.
    backlog: Mutex<VecDeque<Frame>>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.config.name)
            .field("engine", &self.engine)
            .field("scheduler", &self.scheduler)
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Validate `config`, register its arms and comparisons, and route frames
    /// to `sink`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, or [`Error::UnknownArm`] when an explicit
    /// comparison names an arm missing from `config.arms`.
    pub fn new(config: ExperimentConfig, sink: impl FrameSink + 'static) -> Result<Self> {
        config.validate()?;
        let engine = MartingaleEngine::new(config.outcome_model, config.mixture_prior()?);
        for arm in &config.arms {
            engine.register_arm(arm.clone())?;
        }
        for comparison in config.comparison_pairs() {
            engine.register_comparison(comparison.a, comparison.b)?;
        }

        info!(
            name = %config.name,
            arms = config.arms.len(),
            alpha = config.alpha,
            checkpoint = ?config.checkpoint,
            "experiment started"
        );

        Ok(Self {
            scheduler: CheckpointScheduler::new(config.checkpoint),
            renderer: FrameRenderer::new(config.stopping_rule()?, config.representation),
            engine,
            sink: Box::new(sink),
            sequence: SequenceCounter::default(),
            intake: Mutex::new(()),
            backlog: Mutex::new(VecDeque::new()),
            config,
        })
    }

    /// Configuration the experiment was started with.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Underlying engine (read access to states and arm statistics).
    #[must_use]
    pub const fn engine(&self) -> &MartingaleEngine {
        &self.engine
    }

    /// Stopping rule fixed at configuration time.
    #[must_use]
    pub const fn stopping_rule(&self) -> StoppingRule {
        self.renderer.stopping_rule()
    }

    /// **DEPRECATED**: the stopping threshold cannot change
    ///
    /// Thresholding an e-process is only anytime-valid for a threshold fixed
    /// before the data is seen. Start a new experiment instead.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::ThresholdLocked`].
    #[deprecated(
        since = "0.1.0",
        note = "The stopping threshold is fixed by ExperimentConfig::alpha."
    )]
    pub fn set_threshold(&mut self, _threshold: f64) -> Result<()> {
        Err(Error::ThresholdLocked(self.stopping_rule().threshold()))
    }

    /// Register an arm after start.
    ///
    /// # Errors
    ///
    /// See [`MartingaleEngine::register_arm`].
    pub fn register_arm(&self, arm: impl Into<ArmId>) -> Result<()> {
        self.engine.register_arm(arm)
    }

    /// Register a comparison after start.
    ///
    /// # Errors
    ///
    /// See [`MartingaleEngine::register_comparison`].
    pub fn register_comparison(
        &self,
        a: impl Into<ArmId>,
        b: impl Into<ArmId>,
    ) -> Result<ComparisonId> {
        self.engine.register_comparison(a, b)
    }

    /// Ingest an outcome, assigning the next sequence number and stamping the
    /// current time. Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// See [`ingest`](Self::ingest).
    pub fn observe(&self, arm: impl Into<ArmId>, value: f64) -> Result<u64> {
        self.observe_at(arm, value, None, Utc::now())
    }

    /// Ingest an outcome with an optional caller-assigned sequence number and
    /// an explicit arrival time. Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// See [`ingest`](Self::ingest).
    pub fn observe_at(
        &self,
        arm: impl Into<ArmId>,
        value: f64,
        sequence: Option<u64>,
        observed_at: DateTime<Utc>,
    ) -> Result<u64> {
        let _intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        // The counter only advances once the engine accepts the observation,
        // so a rejected one does not burn a number.
        let sequence = sequence.unwrap_or_else(|| self.sequence.peek());
        self.ingest_locked(&Observation::at(arm, value, sequence, observed_at))?;
        Ok(sequence)
    }

    /// Ingest a fully formed observation.
    ///
    /// # Errors
    ///
    /// Engine errors ([`Error::UnknownArm`], [`Error::InvalidObservation`],
    /// [`Error::OrderingViolation`], [`Error::ExperimentClosed`]) leave all
    /// state unchanged.
    ///
    /// Rendering and sink errors are returned after the observation has been
    /// folded in. Every checkpoint it triggered is still rendered, and frames
    /// the sink refused stay in the backlog (see [`flush`](Self::flush)), so
    /// the observation must not be resubmitted.
    pub fn ingest(&self, observation: &Observation) -> Result<()> {
        let _intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        self.ingest_locked(observation)
    }

    fn ingest_locked(&self, observation: &Observation) -> Result<()> {
        let snapshots = self.engine.ingest_capturing(observation)?;
        self.sequence.observe(observation.sequence());

        let mut render_error = None;
        let mut frames = Vec::new();
        for state in snapshots {
            let tick = CheckpointTick::from_state(&state);
            if !self.scheduler.should_checkpoint(state.comparison(), &tick) {
                continue;
            }
            debug!(comparison = %state.comparison(), sample_count = tick.sample_count, "checkpoint");
            match self.render(&state) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    warn!(comparison = %state.comparison(), error = %e, "checkpoint render failed");
                    render_error.get_or_insert(e);
                }
            }
        }

        self.backlog().extend(frames);
        let drained = self.drain_backlog();
        render_error.map_or(drained, Err)
    }

    fn render(&self, state: &PosteriorState) -> Result<Frame> {
        self.renderer.render(state, &self.config.grid)
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Submits queued frames in order. After a refusal, later frames of the
    // same comparison stay behind it; other comparisons are still submitted.
    fn drain_backlog(&self) -> Result<()> {
        let mut backlog = self.backlog();
        let mut blocked: FxHashSet<ComparisonId> = FxHashSet::default();
        let mut retained = VecDeque::new();
        let mut first_error = None;

        while let Some(frame) = backlog.pop_front() {
            if blocked.contains(frame.comparison()) {
                retained.push_back(frame);
                continue;
            }
            let comparison = frame.comparison().clone();
            let sample_count = frame.sample_count();
            if let Err(e) = self.sink.submit(frame.clone()) {
                warn!(comparison = %comparison, sample_count, error = %e, "frame kept for retry");
                blocked.insert(comparison);
                retained.push_back(frame);
                first_error.get_or_insert(e);
            }
        }

        *backlog = retained;
        first_error.map_or(Ok(()), Err)
    }

    /// Retry frames the sink previously refused.
    ///
    /// # Errors
    ///
    /// Returns the first sink error; refused frames stay queued.
    pub fn flush(&self) -> Result<()> {
        let _intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_backlog()
    }

    /// Number of frames waiting to be accepted by the sink.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog().len()
    }

    /// Current state of a comparison.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownComparison`] if the pair was never registered.
    pub fn current_state(&self, comparison: &ComparisonId) -> Result<PosteriorState> {
        self.engine.current_state(comparison)
    }

    /// Close the experiment: freeze the engine and emit a terminal frame for
    /// every comparison with at least one observation. A terminal frame whose
    /// sample count was already checkpointed is discarded by the archive as a
    /// duplicate. Returns the final states.
    ///
    /// # Errors
    ///
    /// Returns rendering or sink errors; the engine stays closed either way
    /// and refused frames stay queued for [`flush`](Self::flush).
    pub fn close(&self) -> Result<Vec<PosteriorState>> {
        let _intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        let finals = self.engine.close();

        let terminal: Vec<&PosteriorState> = finals
            .iter()
            .filter(|state| {
                self.scheduler.should_checkpoint_closing(
                    state.comparison(),
                    &CheckpointTick::from_state(state),
                    true,
                )
            })
            .collect();

        #[cfg(feature = "rayon")]
        let frames: Result<Vec<Frame>> = terminal.par_iter().map(|s| self.render(s)).collect();
        #[cfg(not(feature = "rayon"))]
        let frames: Result<Vec<Frame>> = terminal.iter().map(|s| self.render(s)).collect();

        let frames = frames?;
        for frame in &frames {
            debug!(comparison = %frame.comparison(), sample_count = frame.sample_count(), "terminal frame");
        }
        self.backlog().extend(frames);
        self.drain_backlog()?;
        info!(name = %self.config.name, comparisons = finals.len(), "experiment closed");
        Ok(finals)
    }
}
