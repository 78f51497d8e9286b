//! Persistent frame archive: one JSON file per frame plus one manifest per
//! comparison, servable as static, cacheable artifacts.
//!
//! ```text
//! <root>/
//!   A__vs__B/
//!     manifest.json        frame count, checkpoint policy, grid, index
//!     frame_000000.json
//!     frame_000001.json
//! ```
//!
//! The frame file is written before the manifest, and both are replaced via
//! write-then-rename, so a reader never sees an index entry without its file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    check_append, not_found, AppendOutcome, ArchiveSettings, FrameArchive, FrameIndexEntry,
    StorageHandle,
};
use crate::checkpoint::CheckpointPolicy;
use crate::observation::ComparisonId;
use crate::render::{Frame, GridSpec, Representation};
use crate::{Error, Result};

const MANIFEST_FILE: &str = "manifest.json";

/// Per-comparison manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Comparison the frames belong to
    pub comparison: ComparisonId,
    /// Number of archived frames
    pub frame_count: u64,
    /// Policy that chose the checkpoints
    pub checkpoint_policy: CheckpointPolicy,
    /// Grid the frames were rendered on
    pub grid: GridSpec,
    /// Representation of frame values
    pub representation: Representation,
    /// One record per frame, in frame order
    pub frames: Vec<FrameIndexEntry>,
}

impl Manifest {
    fn empty(comparison: ComparisonId, settings: &ArchiveSettings) -> Self {
        Self {
            comparison,
            frame_count: 0,
            checkpoint_policy: settings.checkpoint_policy,
            grid: settings.grid,
            representation: settings.representation,
            frames: Vec::new(),
        }
    }
}

/// Archive rooted at a directory.
#[derive(Debug)]
pub struct DirectoryFrameArchive {
    root: PathBuf,
    settings: ArchiveSettings,
    manifests: Mutex<FxHashMap<ComparisonId, Manifest>>,
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl DirectoryFrameArchive {
    /// Open (creating if needed) an archive at `root`, reloading any
    /// manifests already present. `settings` are recorded in manifests of
    /// comparisons first archived through this handle.
    ///
    /// # Errors
    ///
    /// Returns IO errors and [`Error::Serialization`](crate::Error::Serialization)
    /// for unreadable manifests.
    pub fn open(root: impl Into<PathBuf>, settings: ArchiveSettings) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut manifests = FxHashMap::default();
        for entry in fs::read_dir(&root)? {
            let path = entry?.path().join(MANIFEST_FILE);
            if !path.is_file() {
                continue;
            }
            let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)?;
            manifests.insert(manifest.comparison.clone(), manifest);
        }
        info!(root = %root.display(), comparisons = manifests.len(), "opened frame archive");

        Ok(Self {
            root,
            settings,
            manifests: Mutex::new(manifests),
        })
    }

    /// Archive root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy of a comparison's manifest.
    #[must_use]
    pub fn manifest(&self, comparison: &ComparisonId) -> Option<Manifest> {
        self.lock().get(comparison).cloned()
    }

    // A failed append leaves the in-memory manifest untouched, so a poisoned
    // lock still guards a consistent index.
    fn lock(&self) -> MutexGuard<'_, FxHashMap<ComparisonId, Manifest>> {
        self.manifests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameArchive for DirectoryFrameArchive {
    fn append(&self, frame: Frame) -> Result<AppendOutcome> {
        let comparison = frame.comparison().clone();
        comparison.validate().map_err(Error::InvalidConfig)?;
        let mut manifests = self.lock();
        let current = manifests
            .get(&comparison)
            .cloned()
            .unwrap_or_else(|| Manifest::empty(comparison.clone(), &self.settings));

        if let Some(existing) = check_append(&current.frames, &frame)? {
            debug!(comparison = %comparison, existing, "duplicate frame discarded");
            return Ok(AppendOutcome::Duplicate(existing));
        }

        let dir_name = comparison.key();
        fs::create_dir_all(self.root.join(&dir_name))?;

        let frame_number = current.frame_count;
        let relative = PathBuf::from(&dir_name).join(format!("frame_{frame_number:06}.json"));
        write_atomically(&self.root.join(&relative), &serde_json::to_vec_pretty(&frame)?)?;

        let mut next = current;
        next.frames.push(FrameIndexEntry {
            frame_number,
            sample_count: frame.sample_count(),
            captured_at: frame.captured_at(),
            handle: StorageHandle::File { path: relative },
        });
        next.frame_count += 1;
        write_atomically(
            &self.root.join(&dir_name).join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&next)?,
        )?;

        debug!(comparison = %comparison, frame_number, sample_count = frame.sample_count(), "frame persisted");
        manifests.insert(comparison, next);
        Ok(AppendOutcome::Appended(frame_number))
    }

    fn get(&self, comparison: &ComparisonId, frame_number: u64) -> Result<Frame> {
        let entry = {
            let manifests = self.lock();
            let frames = manifests.get(comparison).map_or(&[][..], |m| m.frames.as_slice());
            usize::try_from(frame_number)
                .ok()
                .and_then(|i| frames.get(i))
                .cloned()
                .ok_or_else(|| not_found(comparison, frame_number, frames.len() as u64))?
        };
        let path = match entry.handle {
            StorageHandle::File { path } => self.root.join(path),
            StorageHandle::Memory { .. } => {
                return Err(not_found(comparison, frame_number, self.count(comparison)))
            }
        };
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn count(&self, comparison: &ComparisonId) -> u64 {
        self.lock().get(comparison).map_or(0, |m| m.frame_count)
    }

    fn list(&self, comparison: &ComparisonId) -> Vec<FrameIndexEntry> {
        self.lock()
            .get(comparison)
            .map(|m| m.frames.clone())
            .unwrap_or_default()
    }

    fn comparisons(&self) -> Vec<ComparisonId> {
        let mut all: Vec<_> = self
            .lock()
            .values()
            .filter(|m| m.frame_count > 0)
            .map(|m| m.comparison.clone())
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MartingaleEngine, PriorConfig};
    use crate::observation::{Observation, OutcomeModel};
    use crate::render::FrameRenderer;

    fn frame_at(engine: &MartingaleEngine, cmp: &ComparisonId) -> Frame {
        FrameRenderer::default()
            .render(&engine.current_state(cmp).unwrap(), &GridSpec::default())
            .unwrap()
    }

    fn engine() -> (MartingaleEngine, ComparisonId) {
        let engine = MartingaleEngine::new(OutcomeModel::Binary, PriorConfig::default().build().unwrap());
        engine.register_arm("A").unwrap();
        engine.register_arm("B").unwrap();
        let cmp = engine.register_comparison("A", "B").unwrap();
        (engine, cmp)
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, cmp) = engine();
        let settings = ArchiveSettings::default();

        {
            let archive = DirectoryFrameArchive::open(dir.path(), settings).unwrap();
            for seq in 0..3u64 {
                engine.ingest(&Observation::new("A", 1.0, seq * 2)).unwrap();
                engine.ingest(&Observation::new("B", 0.0, seq * 2 + 1)).unwrap();
                archive.append(frame_at(&engine, &cmp)).unwrap();
            }
            assert!(dir.path().join("A__vs__B/frame_000002.json").is_file());
        }

        let reopened = DirectoryFrameArchive::open(dir.path(), settings).unwrap();
        assert_eq!(reopened.count(&cmp), 3);
        let manifest = reopened.manifest(&cmp).unwrap();
        assert_eq!(manifest.frame_count, 3);
        assert_eq!(manifest.checkpoint_policy, settings.checkpoint_policy);
        assert_eq!(manifest.grid, settings.grid);

        let frame = reopened.get(&cmp, 2).unwrap();
        assert_eq!(frame.sample_count(), 6);
        assert_eq!(frame.comparison(), &cmp);
        assert_eq!(frame.values().len(), settings.grid.resolution);
        assert!((frame.integral() - 1.0).abs() < 1e-9);
        assert_eq!(reopened.comparisons(), vec![cmp]);
    }

    #[test]
    fn test_duplicate_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, cmp) = engine();
        let archive = DirectoryFrameArchive::open(dir.path(), ArchiveSettings::default()).unwrap();
        engine.ingest(&Observation::new("A", 1.0, 0)).unwrap();
        let frame = frame_at(&engine, &cmp);

        assert_eq!(archive.append(frame.clone()).unwrap(), AppendOutcome::Appended(0));
        assert_eq!(archive.append(frame).unwrap(), AppendOutcome::Duplicate(0));
        assert!(!dir.path().join("A__vs__B/frame_000001.json").exists());
    }

    #[test]
    fn test_saturated_e_value_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, cmp) = engine();
        for i in 0..1_500u64 {
            engine.ingest(&Observation::new("A", 0.0, 2 * i)).unwrap();
            engine.ingest(&Observation::new("B", 1.0, 2 * i + 1)).unwrap();
        }
        let archive = DirectoryFrameArchive::open(dir.path(), ArchiveSettings::default()).unwrap();
        archive.append(frame_at(&engine, &cmp)).unwrap();

        let summary = archive.get(&cmp, 0).unwrap().summary().clone();
        assert!(summary.log_e_value > 709.0);
        assert!(summary.e_value.is_finite());
        assert!(summary.recommend_stop);
    }

    #[test]
    fn test_unsafe_comparison_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, cmp) = engine();
        engine.ingest(&Observation::new("A", 1.0, 0)).unwrap();
        let mut value = serde_json::to_value(frame_at(&engine, &cmp)).unwrap();
        value["comparison"]["a"] = serde_json::json!("../outside");
        let frame: Frame = serde_json::from_value(value).unwrap();

        let archive = DirectoryFrameArchive::open(dir.path().join("root"), ArchiveSettings::default()).unwrap();
        assert!(matches!(archive.append(frame), Err(Error::InvalidConfig(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(archive.comparisons().is_empty());
    }

    #[test]
    fn test_missing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DirectoryFrameArchive::open(dir.path(), ArchiveSettings::default()).unwrap();
        let err = archive.get(&ComparisonId::new("A", "B"), 0).unwrap_err();
        assert!(matches!(err, Error::FrameNotFound { available: 0, .. }));
    }
}
