//! Distribution packaging of finished binaries.
//!
//! Each binary is wrapped into a single-entry ZIP archive next to it,
//! preserving its Unix permissions so the executable bit survives
//! extraction.

use crate::compression::CompressionLevel;
use crate::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Path of the archive created for `binary`: the binary path plus `.zip`.
pub fn archive_path(binary: &Path) -> PathBuf {
    let mut name = OsString::from(binary.as_os_str());
    name.push(".zip");
    PathBuf::from(name)
}

/// Packages `binary` into [`archive_path`]`(binary)`.
///
/// The archive is written to a temporary file in the same directory and
/// renamed into place, so a failed run never leaves a truncated archive.
///
/// # Errors
///
/// Returns [`Error::Io`] if the binary cannot be read or the archive cannot
/// be created, and [`Error::Zip`] if the ZIP encoding fails.
pub fn package_binary(binary: &Path, level: CompressionLevel) -> Result<PathBuf> {
    let entry_name = binary
        .file_name()
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Not a file path: {}", binary.display()),
            ))
        })?
        .to_string_lossy()
        .into_owned();

    let output = archive_path(binary);
    let dir = binary.parent().unwrap_or_else(|| Path::new("."));
    let metadata = fs::metadata(binary)?;

    let options = if level.level() == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level.level() as i64))
    };

    #[cfg(unix)]
    let options = {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(metadata.permissions().mode())
    };
    #[cfg(not(unix))]
    let _ = &metadata;

    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        zip.start_file(entry_name.as_str(), options)?;
        let mut source = File::open(binary)?;
        io::copy(&mut source, &mut zip)?;
        zip.finish()?;
    }
    tmp.persist(&output).map_err(|e| Error::Io(e.error))?;

    debug!(archive = %output.display(), "Packaged binary");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    #[test]
    fn test_archive_path() {
        assert_eq!(
            archive_path(Path::new("/out/app-windows-amd64.exe")),
            PathBuf::from("/out/app-windows-amd64.exe.zip")
        );
    }

    #[test]
    fn test_package_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let binary = temp_dir.path().join("app-linux-amd64");
        let content = b"\x7fELF fake executable ".repeat(500);
        fs::write(&binary, &content).unwrap();

        let archive = package_binary(&binary, CompressionLevel::DEFAULT).unwrap();
        assert_eq!(archive, temp_dir.path().join("app-linux-amd64.zip"));

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);

        let mut entry = zip.by_index(0).unwrap();
        assert_eq!(entry.name(), "app-linux-amd64");
        let mut extracted = Vec::new();
        entry.read_to_end(&mut extracted).unwrap();
        assert_eq!(extracted, content);
    }

    #[cfg(unix)]
    #[test]
    fn test_package_keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let binary = temp_dir.path().join("app");
        fs::write(&binary, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let archive = package_binary(&binary, CompressionLevel::NONE).unwrap();
        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let entry = zip.by_index(0).unwrap();
        assert_eq!(entry.unix_mode().unwrap() & 0o777, 0o755);
    }

    #[test]
    fn test_missing_binary() {
        let temp_dir = TempDir::new().unwrap();
        let result = package_binary(&temp_dir.path().join("nope"), CompressionLevel::DEFAULT);
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!temp_dir.path().join("nope.zip").exists());
    }
}
