//! Read-only playback over an archive
//!
//! Readers see a frame as soon as its append returns; [`FrameCursor`]
//! re-reads the frame count on every step, so a cursor parked at the latest
//! frame follows a live experiment.

mod heatmap;

pub use heatmap::Heatmap;

use tracing::debug;

use crate::archive::{FrameArchive, FrameIndexEntry};
use crate::observation::ComparisonId;
use crate::render::Frame;
use crate::{Error, Result};

/// Playback surface over any [`FrameArchive`].
#[derive(Debug, Clone)]
pub struct Playback<A> {
    archive: A,
}

impl<A: FrameArchive> Playback<A> {
    /// Wrap an archive.
    pub const fn new(archive: A) -> Self {
        Self { archive }
    }

    /// Underlying archive.
    pub const fn archive(&self) -> &A {
        &self.archive
    }

    /// Comparisons with at least one frame.
    #[must_use]
    pub fn comparisons(&self) -> Vec<ComparisonId> {
        self.archive.comparisons()
    }

    /// Index entries in frame order.
    #[must_use]
    pub fn list_frames(&self, comparison: &ComparisonId) -> Vec<FrameIndexEntry> {
        self.archive.list(comparison)
    }

    /// Number of archived frames.
    #[must_use]
    pub fn count(&self, comparison: &ComparisonId) -> u64 {
        self.archive.count(comparison)
    }

    /// Fetch one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] past the archived range.
    pub fn get_frame(&self, comparison: &ComparisonId, frame_number: u64) -> Result<Frame> {
        self.archive.get(comparison, frame_number)
    }

    /// Newest frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] when nothing has been archived.
    pub fn latest_frame(&self, comparison: &ComparisonId) -> Result<Frame> {
        let count = self.count(comparison);
        self.get_frame(comparison, count.saturating_sub(1))
    }

    /// Cursor positioned on frame 0.
    #[must_use]
    pub fn cursor(&self, comparison: &ComparisonId) -> FrameCursor<'_, A> {
        FrameCursor {
            archive: &self.archive,
            comparison: comparison.clone(),
            position: 0,
        }
    }

    /// Stack every archived frame into a time x effect matrix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] for an empty comparison and
    /// [`Error::InvalidGridSpec`] if frames were rendered on different grids.
    pub fn heatmap(&self, comparison: &ComparisonId) -> Result<Heatmap> {
        let count = self.count(comparison);
        let frames = (0..count)
            .map(|n| self.get_frame(comparison, n))
            .collect::<Result<Vec<_>>>()?;
        debug!(comparison = %comparison, frames = frames.len(), "building heatmap");
        Heatmap::from_frames(comparison.clone(), &frames)
    }
}

/// Step-wise navigation over one comparison's frames.
#[derive(Debug)]
pub struct FrameCursor<'a, A> {
    archive: &'a A,
    comparison: ComparisonId,
    position: u64,
}

impl<A: FrameArchive> FrameCursor<'_, A> {
    /// Frame number the cursor points at.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Comparison being played back.
    #[must_use]
    pub const fn comparison(&self) -> &ComparisonId {
        &self.comparison
    }

    /// Frame under the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] if nothing is archived yet.
    pub fn current(&self) -> Result<Frame> {
        self.archive.get(&self.comparison, self.position)
    }

    /// Whether the cursor is on the newest archived frame.
    #[must_use]
    pub fn is_at_latest(&self) -> bool {
        self.position.saturating_add(1) >= self.archive.count(&self.comparison)
    }

    /// Advance one frame. Returns `None` (without moving) at the newest frame.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the archive.
    pub fn step_forward(&mut self) -> Result<Option<Frame>> {
        if self.is_at_latest() {
            return Ok(None);
        }
        let frame = self.archive.get(&self.comparison, self.position + 1)?;
        self.position += 1;
        Ok(Some(frame))
    }

    /// Go back one frame. Returns `None` (without moving) at frame 0.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the archive.
    pub fn step_back(&mut self) -> Result<Option<Frame>> {
        if self.position == 0 {
            return Ok(None);
        }
        let frame = self.archive.get(&self.comparison, self.position - 1)?;
        self.position -= 1;
        Ok(Some(frame))
    }

    /// Jump to `frame_number`. The cursor does not move on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] past the archived range.
    pub fn seek(&mut self, frame_number: u64) -> Result<Frame> {
        let frame = self.archive.get(&self.comparison, frame_number)?;
        self.position = frame_number;
        Ok(frame)
    }

    /// Jump to the newest frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameNotFound`] if nothing is archived yet.
    pub fn seek_latest(&mut self) -> Result<Frame> {
        match self.archive.count(&self.comparison) {
            0 => Err(Error::FrameNotFound {
                comparison: self.comparison.to_string(),
                frame_number: 0,
                available: 0,
            }),
            n => self.seek(n - 1),
        }
    }
}
