//! Frame archive and metadata index
//!
//! Frames are write-once, read-many. Each comparison has its own contiguous
//! frame sequence starting at 0; frame numbers are never reused or reordered.
//!
//! ## Idempotent append
//!
//! Appending a frame whose sample count is already archived for its
//! comparison is reported as [`AppendOutcome::Duplicate`] and stores nothing,
//! so at-least-once delivery from a retrying writer is safe. A frame older
//! than the newest archived one, with no matching entry, is an ordering
//! violation.
//!
//! # Example
//!
//! ```rust
//! use martingale_posteriors::archive::{AppendOutcome, FrameArchive, MemoryFrameArchive};
//! use martingale_posteriors::engine::{MartingaleEngine, PriorConfig};
//! use martingale_posteriors::observation::{Observation, OutcomeModel};
//! use martingale_posteriors::render::{FrameRenderer, GridSpec};
//!
//! let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build()?);
//! engine.register_arm("A")?;
//! engine.register_arm("B")?;
//! let cmp = engine.register_comparison("A", "B")?;
//! engine.ingest(&Observation::new("A", 1.0, 0))?;
//!
//! let frame = FrameRenderer::default().render(&engine.current_state(&cmp)?, &GridSpec::default())?;
//! let archive = MemoryFrameArchive::new();
//! assert_eq!(archive.append(frame.clone())?, AppendOutcome::Appended(0));
//! assert_eq!(archive.append(frame)?, AppendOutcome::Duplicate(0));
//! assert_eq!(archive.count(&cmp), 1);
//! # Ok::<(), martingale_posteriors::Error>(())
//! ```

mod directory;
mod memory;
#[cfg(feature = "tokio")]
mod queued;

pub use directory::{DirectoryFrameArchive, Manifest};
pub use memory::MemoryFrameArchive;
#[cfg(feature = "tokio")]
pub use queued::{DrainReport, QueuedArchive, RetryPolicy};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointPolicy;
use crate::observation::ComparisonId;
use crate::render::{Frame, GridSpec, Representation};
use crate::{Error, Result};

/// Where an archived frame lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageHandle {
    /// Slot in an in-memory archive
    Memory {
        /// Position in the comparison's frame vector
        slot: usize,
    },
    /// File relative to the archive root
    File {
        /// Relative path
        path: PathBuf,
    },
}

/// Index entry: frame number to capture metadata and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameIndexEntry {
    /// Contiguous frame number, starting at 0
    pub frame_number: u64,
    /// Sample count that triggered the checkpoint
    pub sample_count: u64,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
    /// Storage location
    pub handle: StorageHandle,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored under this frame number
    Appended(u64),
    /// A frame with the same sample count is already stored under this number
    Duplicate(u64),
}

impl AppendOutcome {
    /// Frame number the frame ended up under.
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        match self {
            Self::Appended(n) | Self::Duplicate(n) => n,
        }
    }
}

/// Checkpoint policy and grid recorded in persisted manifests.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Policy that chose the checkpoints
    pub checkpoint_policy: CheckpointPolicy,
    /// Grid the frames were rendered on
    pub grid: GridSpec,
    /// Representation of frame values
    pub representation: Representation,
}

/// Append-only, per-comparison frame storage.
pub trait FrameArchive: Send + Sync {
    /// Assign the next frame number and store `frame`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OrderingViolation`] for a stale frame and storage
    /// errors from persistent backends.
    fn append(&self, frame: Frame) -> Result<AppendOutcome>;

    /// Fetch a frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] when `frame_number` is past the
    /// archived range.
    fn get(&self, comparison: &ComparisonId, frame_number: u64) -> Result<Frame>;

    /// Number of archived frames for `comparison`.
    fn count(&self, comparison: &ComparisonId) -> u64;

    /// Index entries in frame order.
    fn list(&self, comparison: &ComparisonId) -> Vec<FrameIndexEntry>;

    /// Comparisons with at least one frame, sorted.
    fn comparisons(&self) -> Vec<ComparisonId>;

    /// Newest index entry, if any.
    fn latest(&self, comparison: &ComparisonId) -> Option<FrameIndexEntry> {
        self.list(comparison).pop()
    }
}

impl<T: FrameArchive + ?Sized> FrameArchive for Arc<T> {
    fn append(&self, frame: Frame) -> Result<AppendOutcome> {
        (**self).append(frame)
    }

    fn get(&self, comparison: &ComparisonId, frame_number: u64) -> Result<Frame> {
        (**self).get(comparison, frame_number)
    }

    fn count(&self, comparison: &ComparisonId) -> u64 {
        (**self).count(comparison)
    }

    fn list(&self, comparison: &ComparisonId) -> Vec<FrameIndexEntry> {
        (**self).list(comparison)
    }

    fn comparisons(&self) -> Vec<ComparisonId> {
        (**self).comparisons()
    }

    fn latest(&self, comparison: &ComparisonId) -> Option<FrameIndexEntry> {
        (**self).latest(comparison)
    }
}

/// Destination for rendered frames: an archive directly, or a queue in
/// front of one.
pub trait FrameSink: Send + Sync {
    /// Hand a frame over for archival.
    ///
    /// # Errors
    ///
    /// Returns archive errors (direct) or [`Error::QueueClosed`] (queued).
    fn submit(&self, frame: Frame) -> Result<()>;
}

impl<T: FrameArchive> FrameSink for T {
    fn submit(&self, frame: Frame) -> Result<()> {
        self.append(frame).map(|_| ())
    }
}

/// Decide whether `frame` extends `entries`, duplicates one of them, or is
/// out of order.
fn check_append(entries: &[FrameIndexEntry], frame: &Frame) -> Result<Option<u64>> {
    let Some(last) = entries.last() else {
        return Ok(None);
    };
    if frame.sample_count() > last.sample_count {
        return Ok(None);
    }
    entries
        .iter()
        .find(|e| e.sample_count == frame.sample_count())
        .map(|e| Some(e.frame_number))
        .ok_or(Error::OrderingViolation {
            last: last.sample_count,
            got: frame.sample_count(),
        })
}

fn not_found(comparison: &ComparisonId, frame_number: u64, available: u64) -> Error {
    Error::FrameNotFound {
        comparison: comparison.to_string(),
        frame_number,
        available,
    }
}
