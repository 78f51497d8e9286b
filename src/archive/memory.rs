//! In-memory frame archive using `DashMap`.
//!
//! Frames are lost on process restart; use
//! [`DirectoryFrameArchive`](super::DirectoryFrameArchive) to persist them.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{check_append, not_found, AppendOutcome, FrameArchive, FrameIndexEntry, StorageHandle};
use crate::observation::ComparisonId;
use crate::render::Frame;
use crate::Result;

#[derive(Debug, Default)]
struct FrameSequence {
    entries: Vec<FrameIndexEntry>,
    frames: Vec<Arc<Frame>>,
}

/// Concurrent in-memory archive.
///
/// Appends for one comparison are serialized by the map's per-entry lock;
/// different comparisons proceed independently.
#[derive(Debug, Default)]
pub struct MemoryFrameArchive {
    sequences: DashMap<ComparisonId, FrameSequence>,
}

impl MemoryFrameArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames across all comparisons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.iter().map(|s| s.frames.len()).sum()
    }

    /// Whether no frame has been archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameArchive for MemoryFrameArchive {
    fn append(&self, frame: Frame) -> Result<AppendOutcome> {
        let mut sequence = self.sequences.entry(frame.comparison().clone()).or_default();
        if let Some(existing) = check_append(&sequence.entries, &frame)? {
            debug!(comparison = %frame.comparison(), existing, "duplicate frame discarded");
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let slot = sequence.frames.len();
        let frame_number = slot as u64;
        sequence.entries.push(FrameIndexEntry {
            frame_number,
            sample_count: frame.sample_count(),
            captured_at: frame.captured_at(),
            handle: StorageHandle::Memory { slot },
        });
        sequence.frames.push(Arc::new(frame));
        Ok(AppendOutcome::Appended(frame_number))
    }

    fn get(&self, comparison: &ComparisonId, frame_number: u64) -> Result<Frame> {
        let sequence = self.sequences.get(comparison);
        let available = sequence.as_ref().map_or(0, |s| s.frames.len() as u64);
        sequence
            .as_ref()
            .and_then(|s| usize::try_from(frame_number).ok().and_then(|i| s.frames.get(i)))
            .map(|frame| Frame::clone(frame))
            .ok_or_else(|| not_found(comparison, frame_number, available))
    }

    fn count(&self, comparison: &ComparisonId) -> u64 {
        self.sequences
            .get(comparison)
            .map_or(0, |s| s.entries.len() as u64)
    }

    fn list(&self, comparison: &ComparisonId) -> Vec<FrameIndexEntry> {
        self.sequences
            .get(comparison)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    fn comparisons(&self) -> Vec<ComparisonId> {
        let mut all: Vec<_> = self
            .sequences
            .iter()
            .filter(|s| !s.entries.is_empty())
            .map(|s| s.key().clone())
            .collect();
        all.sort();
        all
    }
}
