//! Single-level directory scanning
//!
//! One scan covers exactly one directory, non-recursively, producing
//! ephemeral [`ScannedItem`] descriptors for its immediate children.
//! The reconciler schedules scans lazily per level; descriptors are
//! discarded after that level has been reconciled.

use std::path::Path;

use color_eyre::Result;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::fsaccess::{EntryKind, FsAccess, Fsid};

/// Descriptor for one directory child, produced fresh by each scan
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScannedItem {
    /// Leaf name as found on disk
    pub name: String,
    pub kind: EntryKind,
    /// Stable id, when the filesystem provides one
    pub fsid: Option<Fsid>,
    /// Content fingerprint (files only)
    pub fingerprint: Option<Fingerprint>,
    pub size: i64,
    pub mtime: i64,
    pub is_symlink: bool,
}

/// Result of scanning one directory level
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub items: Vec<ScannedItem>,
    /// At least one child was transiently inaccessible; the level
    /// should be rescanned on a later tick
    pub retry: bool,
}

/// Scans one directory at a time through the [`FsAccess`] seam
pub struct DirectoryScanner<'a> {
    fs: &'a dyn FsAccess,
    debris: &'a Path,
}

impl<'a> DirectoryScanner<'a> {
    #[must_use]
    pub fn new(fs: &'a dyn FsAccess, debris: &'a Path) -> Self {
        Self { fs, debris }
    }

    /// Scan the immediate children of `dir`.
    ///
    /// Skips the debris folder. Symlinks are reported with the symlink
    /// flag set so the caller can exclude them from synchronization.
    /// Transiently blocked children are omitted and flagged via
    /// [`ScanOutcome::retry`].
    ///
    /// # Errors
    /// Returns an error if the directory itself cannot be opened or
    /// listed (the caller decides retry-vs-abort from the error's
    /// transient flag).
    pub fn scan_one(&self, dir: &Path) -> Result<ScanOutcome> {
        if dir.starts_with(self.debris) {
            return Ok(ScanOutcome::default());
        }

        debug!(path = %dir.display(), "scanning folder");

        let names = self.fs.list_dir(dir)?;
        let mut outcome = ScanOutcome::default();

        for name in names {
            let child_path = dir.join(&name);
            if child_path.starts_with(self.debris) {
                continue;
            }

            match self.fs.open(&child_path, true, false) {
                Ok(info) => {
                    let fingerprint = (info.kind == EntryKind::File && !info.is_symlink)
                        .then(|| Fingerprint::of_file(info.size, info.mtime));
                    outcome.items.push(ScannedItem {
                        name,
                        kind: info.kind,
                        fsid: info.fsid,
                        fingerprint,
                        size: info.size,
                        mtime: info.mtime,
                        is_symlink: info.is_symlink,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(path = %child_path.display(), "file blocked, queueing recheck");
                    outcome.retry = true;
                }
                Err(e) => {
                    // vanished between listing and open, or unreadable;
                    // absence is handled by missing detection
                    debug!(path = %child_path.display(), error = %e, "skipping unreadable entry");
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsaccess::StdFs;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_single_level_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/deep.txt"), b"d").unwrap();

        let fs_access = StdFs::new();
        let debris = dir.path().join(".debris");
        let scanner = DirectoryScanner::new(&fs_access, &debris);
        let outcome = scanner.scan_one(dir.path()).unwrap();

        assert!(!outcome.retry);
        assert_eq!(outcome.items.len(), 2);

        let file = outcome.items.iter().find(|i| i.name == "a.txt").unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.fingerprint.unwrap().size, 3);

        let sub = outcome.items.iter().find(|i| i.name == "sub").unwrap();
        assert_eq!(sub.kind, EntryKind::Folder);
        assert!(sub.fingerprint.is_none());
    }

    #[test]
    fn test_scan_skips_debris() {
        let dir = TempDir::new().unwrap();
        let debris = dir.path().join(".debris");
        fs::create_dir(&debris).unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();

        let fs_access = StdFs::new();
        let scanner = DirectoryScanner::new(&fs_access, &debris);
        let outcome = scanner.scan_one(dir.path()).unwrap();

        let names: Vec<_> = outcome.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn test_scan_inside_debris_is_empty() {
        let dir = TempDir::new().unwrap();
        let debris = dir.path().join(".debris");
        fs::create_dir(&debris).unwrap();
        fs::write(debris.join("old.txt"), b"o").unwrap();

        let fs_access = StdFs::new();
        let scanner = DirectoryScanner::new(&fs_access, &debris);
        let outcome = scanner.scan_one(&debris).unwrap();
        assert!(outcome.items.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_flags_symlinks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), b"r").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let fs_access = StdFs::new();
        let debris = dir.path().join(".debris");
        let scanner = DirectoryScanner::new(&fs_access, &debris);
        let outcome = scanner.scan_one(dir.path()).unwrap();

        let link = outcome.items.iter().find(|i| i.name == "link.txt").unwrap();
        assert!(link.is_symlink);
        assert!(link.fingerprint.is_none());
    }
}
