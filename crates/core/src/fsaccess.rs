//! Filesystem collaborator traits and the std-backed implementation
//!
//! The engine never touches the filesystem directly; it goes through
//! [`FsAccess`], which exposes stat-style opens, per-level directory
//! listing, rename and mkdir. Errors carry the transient/permanent
//! split: a transient failure (file locked) is retried on a later tick,
//! a permanent one surfaces as a scan failure or local deletion.

use std::io;
use std::path::Path;

/// Volume-level stable identifier for a file or directory (inode-like)
pub type Fsid = u64;

/// File or folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    File,
    Folder,
}

/// Filesystem error with retry classification
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Potentially transient (file locked, interrupted) - retry later
    #[error("transient filesystem error: {0}")]
    Transient(#[source] io::Error),

    /// Permanent (missing, corrupt, permission) - not retried
    #[error("filesystem error: {0}")]
    Permanent(#[source] io::Error),

    /// Rename target already exists
    #[error("target already exists")]
    TargetExists,

    /// Expected a directory, found something else
    #[error("not a directory")]
    NotADirectory,
}

impl FsError {
    /// Whether the operation is worth retrying on a later tick
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Self::Transient(err)
            }
            _ => Self::Permanent(err),
        }
    }
}

/// Result of opening (stat-ing) a path
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub kind: EntryKind,
    /// Size in bytes (0 for folders)
    pub size: i64,
    /// Modification time, seconds since UNIX epoch
    pub mtime: i64,
    /// Stable id, if the filesystem provides one
    pub fsid: Option<Fsid>,
    pub is_symlink: bool,
}

/// Outcome of a mkdir request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirOutcome {
    Created,
    AlreadyExists,
}

/// Narrow filesystem interface used by the sync core
pub trait FsAccess {
    /// Open a path for inspection. `want_read`/`want_write` express the
    /// intended access so implementations can surface lock conflicts
    /// early (with the transient flag set).
    fn open(&self, path: &Path, want_read: bool, want_write: bool) -> Result<FileInfo, FsError>;

    /// List the immediate child names of a directory, one level only
    fn list_dir(&self, path: &Path) -> Result<Vec<String>, FsError>;

    /// Rename without overwriting; a pre-existing target fails with
    /// [`FsError::TargetExists`]
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Create a directory, optionally with all missing parents
    fn mkdir(&self, path: &Path, recursive: bool) -> Result<MkdirOutcome, FsError>;

    /// Filesystem short-name hint (8.3 style), if the platform has one
    fn shortname(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// `std::fs`-backed implementation
#[derive(Debug, Default)]
pub struct StdFs;

impl StdFs {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FsAccess for StdFs {
    fn open(&self, path: &Path, _want_read: bool, _want_write: bool) -> Result<FileInfo, FsError> {
        let link_meta = std::fs::symlink_metadata(path).map_err(FsError::classify)?;
        if link_meta.file_type().is_symlink() {
            return Ok(FileInfo {
                kind: EntryKind::File,
                size: 0,
                mtime: 0,
                fsid: None,
                is_symlink: true,
            });
        }

        let kind = if link_meta.is_dir() {
            EntryKind::Folder
        } else {
            EntryKind::File
        };

        let mtime = link_meta
            .modified()
            .map_err(FsError::classify)?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let fsid = {
            use std::os::unix::fs::MetadataExt;
            Some(link_meta.ino())
        };
        #[cfg(not(unix))]
        let fsid = None;

        Ok(FileInfo {
            kind,
            size: link_meta.len() as i64,
            mtime,
            fsid,
            is_symlink: false,
        })
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let iter = std::fs::read_dir(path).map_err(FsError::classify)?;
        let mut names = Vec::new();
        for entry in iter {
            let entry = entry.map_err(FsError::classify)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        // std::fs::rename overwrites on Unix; refuse instead so debris
        // collision handling can pick the next suffix
        if std::fs::symlink_metadata(to).is_ok() {
            return Err(FsError::TargetExists);
        }
        std::fs::rename(from, to).map_err(FsError::classify)
    }

    fn mkdir(&self, path: &Path, recursive: bool) -> Result<MkdirOutcome, FsError> {
        let result = if recursive {
            std::fs::create_dir_all(path)
        } else {
            std::fs::create_dir(path)
        };
        match result {
            Ok(()) => Ok(MkdirOutcome::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match std::fs::metadata(path) {
                    Ok(meta) if meta.is_dir() => Ok(MkdirOutcome::AlreadyExists),
                    // blocked by a non-directory of the same name
                    _ => Err(FsError::NotADirectory),
                }
            }
            Err(e) => Err(FsError::classify(e)),
        }
    }
}
