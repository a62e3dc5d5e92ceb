//! Per-run batch completion manifest.
//!
//! Skip-by-file-existence alone cannot tell a fully written batch from one
//! that died mid-write, so each run directory carries a `manifest.json`
//! recording which batch indices completed, rewritten after every batch.
//! Completion checks consult the manifest first and fall back to
//! file-existence (all expected files present and non-empty) for
//! directories populated before the manifest existed.
//!
//! The manifest stores the batch size it was written under; a manifest from
//! a different batch size is discarded, since batch indices no longer mean
//! the same slices.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Manifest filename inside a run directory.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Batch completion record for one run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    batch_size: usize,
    completed: BTreeSet<usize>,
}

impl RunManifest {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            completed: BTreeSet::new(),
        }
    }

    /// Load the manifest from `run_dir`, or start a fresh one.
    ///
    /// A missing file, an unparseable file, or a batch-size mismatch all
    /// yield a fresh manifest; the file-existence fallback still honors any
    /// batches whose outputs are intact.
    pub fn load_or_new(run_dir: &Path, batch_size: usize) -> Self {
        let path = run_dir.join(MANIFEST_NAME);
        let Ok(contents) = fs::read_to_string(&path) else {
            return Self::new(batch_size);
        };
        match serde_json::from_str::<Self>(&contents) {
            Ok(manifest) if manifest.batch_size == batch_size => manifest,
            Ok(manifest) => {
                tracing::warn!(
                    recorded = manifest.batch_size,
                    requested = batch_size,
                    "manifest written under a different batch size, ignoring it"
                );
                Self::new(batch_size)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable manifest, starting fresh");
                Self::new(batch_size)
            }
        }
    }

    pub fn is_complete(&self, batch_index: usize) -> bool {
        self.completed.contains(&batch_index)
    }

    pub fn mark_complete(&mut self, batch_index: usize) {
        self.completed.insert(batch_index);
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Persist to `run_dir`, replacing any previous manifest.
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let path = run_dir.join(MANIFEST_NAME);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// File-existence completion check: every path present and non-empty.
///
/// Zero-length files do not count as done — a crash between `create` and
/// the first sample write must not mark the batch complete.
pub fn batch_files_present(paths: &[PathBuf]) -> bool {
    paths.iter().all(|path| {
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = RunManifest::load_or_new(tmp.path(), 8);
        assert_eq!(manifest.completed_count(), 0);

        manifest.mark_complete(0);
        manifest.mark_complete(2);
        manifest.save(tmp.path()).unwrap();

        let reloaded = RunManifest::load_or_new(tmp.path(), 8);
        assert!(reloaded.is_complete(0));
        assert!(!reloaded.is_complete(1));
        assert!(reloaded.is_complete(2));
    }

    #[test]
    fn batch_size_mismatch_discards() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = RunManifest::load_or_new(tmp.path(), 8);
        manifest.mark_complete(0);
        manifest.save(tmp.path()).unwrap();

        let reloaded = RunManifest::load_or_new(tmp.path(), 4);
        assert!(!reloaded.is_complete(0));
    }

    #[test]
    fn corrupt_manifest_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_NAME), "{not json").unwrap();
        let manifest = RunManifest::load_or_new(tmp.path(), 8);
        assert_eq!(manifest.completed_count(), 0);
    }

    #[test]
    fn empty_file_is_not_present() {
        let tmp = tempfile::tempdir().unwrap();
        let full = tmp.path().join("full.wav");
        let empty = tmp.path().join("empty.wav");
        fs::write(&full, b"RIFFdata").unwrap();
        fs::write(&empty, b"").unwrap();

        assert!(batch_files_present(&[full.clone()]));
        assert!(!batch_files_present(&[full.clone(), empty]));
        assert!(!batch_files_present(&[tmp.path().join("missing.wav")]));
    }
}
