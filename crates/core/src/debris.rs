//! Local debris: deletions are quarantined, not destroyed
//!
//! Anything the engine would otherwise delete locally is renamed into a
//! day-stamped folder under the debris root. Renames never overwrite;
//! on a same-day name collision the day folder gets a time-of-day
//! suffix and the move is retried a bounded number of times.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, warn};

use crate::fsaccess::{FsAccess, FsError};

/// Moves doomed local files into the dated debris folder
pub struct DebrisArchiver<'a> {
    fs: &'a dyn FsAccess,
    debris_root: PathBuf,
}

impl<'a> DebrisArchiver<'a> {
    #[must_use]
    pub fn new(fs: &'a dyn FsAccess, debris_root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            debris_root: debris_root.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.debris_root
    }

    /// Move `path` into today's debris folder, returning its resting
    /// place.
    ///
    /// The first attempt assumes the folders already exist; later
    /// attempts create the debris root and the day folder on demand,
    /// then fall back to suffixed day folders (`YYYY-MM-DD HH.MM.SS.NN`)
    /// when the target name is already taken.
    ///
    /// # Errors
    /// Fails on a transient filesystem error, or on a permanent error
    /// once the day folder is known to exist (meaning the rename itself
    /// is what failed).
    pub fn archive(&self, path: &Path) -> Result<PathBuf, FsError> {
        let Some(leaf) = path.file_name() else {
            return Err(FsError::NotADirectory);
        };
        let now = Local::now();
        let day = now.format("%Y-%m-%d").to_string();
        let mut havedir = false;

        for attempt in -3i32..100 {
            if attempt == -2 || attempt > 95 {
                debug!(path = %self.debris_root.display(), "creating debris root");
                let _ = self.fs.mkdir(&self.debris_root, true);
            }

            let day_name = if attempt >= 0 {
                format!("{day} {}.{:02}", now.format("%H.%M.%S"), attempt)
            } else {
                day.clone()
            };
            let day_dir = self.debris_root.join(&day_name);

            if attempt > -3 {
                havedir = match self.fs.mkdir(&day_dir, false) {
                    Ok(_) => true,
                    Err(FsError::NotADirectory) => false,
                    Err(e) if e.is_transient() => return Err(e),
                    Err(_) => havedir,
                };
            }

            let target = day_dir.join(leaf);
            match self.fs.rename(path, &target) {
                Ok(()) => {
                    debug!(from = %path.display(), to = %target.display(), "archived to debris");
                    return Ok(target);
                }
                Err(FsError::TargetExists) => continue,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    if havedir {
                        warn!(path = %path.display(), error = %e, "debris move failed");
                        return Err(e);
                    }
                    // folders not there yet; the next attempt creates them
                }
            }
        }

        warn!(path = %path.display(), "exhausted debris name candidates");
        Err(FsError::TargetExists)
    }
}
