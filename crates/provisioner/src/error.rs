//! Error types for provisioning operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure case of
//! the certificate authority, the binary appender and the build orchestrator.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for provisioning operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
/// Match on variants to handle specific failure cases.
///
/// # Examples
///
/// ```no_run
/// use provisioner::ca::CertStore;
/// use provisioner::Error;
///
/// let store = CertStore::new("/tmp/settings/cert");
/// match store.read_certificate("root") {
///     Ok(cert) => println!("root serial: {:?}", cert.serial_number().to_bn()),
///     Err(Error::NotFound(path)) => eprintln!("no root yet at {}", path.display()),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// Key pair generation failed.
    ///
    /// The system random source or the RSA generator reported an error.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate construction or signing failed.
    #[error("Certificate signing failed: {0}")]
    Signing(String),

    /// An identity file could not be written.
    ///
    /// Returned instead of an identity so that a half-persisted CA is never
    /// mistaken for a usable one.
    #[error("Failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A persisted identity file does not exist.
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A persisted identity file exists but is not valid PEM, or its content
    /// does not parse as a certificate or private key.
    #[error("Failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    /// A client label is reserved or is not a safe file name.
    #[error("Invalid client label {0:?}")]
    InvalidLabel(String),

    /// A host file could not be opened for read/write.
    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the payload source failed during an append.
    #[error("Failed to read append source: {0}")]
    SourceRead(#[source] io::Error),

    /// Writing to the host file failed during an append or close.
    #[error("Failed to write host file: {0}")]
    SinkWrite(#[source] io::Error),

    /// No appended payload with the requested name exists in the host file.
    #[error("No appended payload named {0:?}")]
    PayloadNotFound(String),

    /// The recorded byte range or the index trailer does not decode.
    #[error("Corrupt appended data: {0}")]
    CorruptData(String),

    /// An operation was attempted on an appender that has been closed.
    #[error("Appender is already closed")]
    AlreadyClosed,

    /// The compiler collaborator failed for one target.
    #[error("Compile failed for {target}: {diagnostic}")]
    Compile { target: String, diagnostic: String },

    /// Creation of a missing directory was not confirmed.
    #[error("Refusing to create {} (nearest existing ancestor: {})", path.display(), existing.display())]
    DirectoryRefused { path: PathBuf, existing: PathBuf },

    /// The filesystem is in a state the caller's invariants exclude, such as
    /// a root certificate whose private key is missing.
    #[error("Filesystem inconsistency: {0}")]
    FilesystemInconsistency(String),

    /// Invalid settings or target description.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Packaging a finished binary into a ZIP archive failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an I/O error raised while writing `path`.
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_message_is_generic() {
        let err: Error = serde_json::from_slice::<Vec<u8>>(b"{").unwrap_err().into();
        let message = err.to_string();
        assert!(message.starts_with("JSON error: "));
        assert!(!message.contains("Settings"));
    }
}
