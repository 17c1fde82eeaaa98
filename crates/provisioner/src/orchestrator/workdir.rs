//! Scoped change of the process working directory.

use crate::Result;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Restores the working directory captured at construction when dropped.
#[must_use = "the previous directory is restored when the guard is dropped"]
#[derive(Debug)]
pub struct WorkingDirGuard {
    original: PathBuf,
}

impl WorkingDirGuard {
    /// Records the current directory and, if `dir` is given, changes into it.
    pub fn enter(dir: Option<&Path>) -> Result<Self> {
        let original = env::current_dir()?;
        let guard = Self { original };
        if let Some(dir) = dir {
            env::set_current_dir(dir)?;
            debug!(dir = %dir.display(), "Entered client source directory");
        }
        Ok(guard)
    }

    pub fn original(&self) -> &Path {
        &self.original
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.original) {
            error!(
                dir = %self.original.display(),
                error = %e,
                "Failed to restore working directory"
            );
        }
    }
}
