//! Error types for martingale-posteriors
//!
//! Every statistical-update error is local: it rejects the offending call and
//! leaves engine state exactly as it was before the call.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Engine, rendering and archive errors
#[derive(Error, Debug)]
pub enum Error {
    /// Observation or comparison references an arm that was never registered
    #[error("Unknown arm: {0}\nRegister the arm before ingesting observations for it.")]
    UnknownArm(String),

    /// Query or registration references a comparison that was never registered
    #[error("Unknown comparison: {0}")]
    UnknownComparison(String),

    /// Outcome value outside the declared model support
    #[error("Invalid observation for arm {arm}: {reason}")]
    InvalidObservation {
        /// Arm the observation was addressed to
        arm: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Rendering misconfiguration
    #[error("Invalid grid spec: {0}")]
    InvalidGridSpec(String),

    /// Playback asked for a frame past the archived range
    #[error("Frame {frame_number} not found for {comparison} ({available} archived)")]
    FrameNotFound {
        /// Comparison that was queried
        comparison: String,
        /// Requested frame number
        frame_number: u64,
        /// Number of frames currently archived
        available: u64,
    },

    /// Observation (or frame) arrived out of sequence
    #[error("Ordering violation: sequence {got} arrived after {last}\nObservations must be ingested in arrival order.")]
    OrderingViolation {
        /// Last accepted sequence number (or sample count, for frames)
        last: u64,
        /// Offending sequence number
        got: u64,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Attempt to change the stopping threshold after configuration
    #[error("Stopping threshold is fixed at configuration time (current: {0})\nChanging it mid-experiment would invalidate the anytime-valid guarantee.")]
    ThresholdLocked(f64),

    /// Ingestion after the experiment was closed
    #[error("Experiment is closed; no further observations are accepted")]
    ExperimentClosed,

    /// Archival queue closed (drain task gone)
    #[error("Archive queue closed (receiver dropped)")]
    QueueClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the same call later and expect success.
    ///
    /// `FrameNotFound` means "not yet available" for a running experiment;
    /// IO failures in the archive are retried by the queued writer.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::FrameNotFound { .. } | Self::Io(_))
    }
}
