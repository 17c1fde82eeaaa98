//! Confirmed creation of missing directories.

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Decides whether a missing directory may be created.
pub trait ConfirmDirectory: Send + Sync {
    /// `path` is the directory to create; `existing` is its nearest ancestor
    /// that already exists.
    fn confirm(&self, path: &Path, existing: &Path) -> bool;
}

/// Refuses every request. Used when no interactive channel exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct Refuse;

impl ConfirmDirectory for Refuse {
    fn confirm(&self, _path: &Path, _existing: &Path) -> bool {
        false
    }
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConfirmDirectory for AllowAll {
    fn confirm(&self, _path: &Path, _existing: &Path) -> bool {
        true
    }
}

impl<F> ConfirmDirectory for F
where
    F: Fn(&Path, &Path) -> bool + Send + Sync,
{
    fn confirm(&self, path: &Path, existing: &Path) -> bool {
        self(path, existing)
    }
}

/// Walks up from `path` to the closest directory that exists.
///
/// A relative path runs out of components at the current directory, which is
/// returned as `.`.
///
/// # Errors
///
/// Returns [`Error::Config`] if a component of the path exists but is not a
/// directory, and [`Error::FilesystemInconsistency`] if no ancestor exists at
/// all.
pub fn find_existing_ancestor(path: &Path) -> Result<PathBuf> {
    let mut current = Some(path);

    while let Some(candidate) = current {
        match fs::metadata(candidate) {
            Ok(meta) if meta.is_dir() => return Ok(candidate.to_path_buf()),
            Ok(_) => {
                return Err(Error::Config(format!(
                    "{} exists but is not a directory",
                    candidate.display()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let cwd = Path::new(".");
                current = match candidate.parent() {
                    Some(parent) if parent.as_os_str().is_empty() => {
                        (candidate != cwd).then_some(cwd)
                    }
                    parent => parent,
                };
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Err(Error::FilesystemInconsistency(format!(
        "no existing ancestor of {}",
        path.display()
    )))
}

/// Ensures `path` exists as a directory.
///
/// Missing directories are created silently when the nearest existing
/// ancestor is inside `trusted_root`; otherwise `confirm` is asked first.
///
/// # Errors
///
/// Returns [`Error::DirectoryRefused`] when creation was not confirmed.
pub fn ensure_dir(
    path: &Path,
    trusted_root: Option<&Path>,
    confirm: &dyn ConfirmDirectory,
) -> Result<()> {
    let existing = find_existing_ancestor(path)?;
    if existing == path {
        return Ok(());
    }

    let trusted = trusted_root.is_some_and(|root| existing.starts_with(root));
    if !trusted && !confirm.confirm(path, &existing) {
        return Err(Error::DirectoryRefused {
            path: path.to_path_buf(),
            existing,
        });
    }

    fs::create_dir_all(path)?;
    info!(dir = %path.display(), "Created directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_existing_dir_needs_no_confirmation() {
        let dir = tempdir().unwrap();
        ensure_dir(dir.path(), None, &Refuse).unwrap();
    }

    #[test]
    fn test_refusal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b");

        let err = ensure_dir(&target, None, &Refuse).unwrap_err();
        match err {
            Error::DirectoryRefused { path, existing } => {
                assert_eq!(path, target);
                assert_eq!(existing, dir.path());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_confirmation_receives_ancestor() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x/y/z");
        let calls = AtomicUsize::new(0);
        let root = dir.path().to_path_buf();

        let confirm = |path: &Path, existing: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            path.ends_with("x/y/z") && existing == root
        };
        ensure_dir(&target, None, &confirm).unwrap();

        assert!(target.is_dir());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trusted_root_skips_prompt() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("cert");
        ensure_dir(&target, Some(dir.path()), &Refuse).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_relative_path_falls_back_to_current_dir() {
        let missing = Path::new("no-such-provisioner-dir").join("sub");
        assert_eq!(find_existing_ancestor(&missing).unwrap(), Path::new("."));

        match ensure_dir(&missing, None, &Refuse).unwrap_err() {
            Error::DirectoryRefused { existing, .. } => assert_eq!(existing, Path::new(".")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!missing.exists());
    }

    #[test]
    fn test_file_in_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        let result = ensure_dir(&file.join("sub"), None, &AllowAll);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
