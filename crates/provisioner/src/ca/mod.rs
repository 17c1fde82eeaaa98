//! Minimal certificate authority for the client fleet.
//!
//! The CA issues one long-lived self-signed root identity and any number of
//! client identities signed by it. Identities are persisted as PEM files in a
//! [`CertStore`] directory:
//!
//! | File | Content |
//! |------|---------|
//! | `root.crt` | Root certificate |
//! | `root.key` | Root private key (PKCS#8, owner-only on Unix) |
//! | `<label>.crt` | One client certificate per issued label |
//!
//! Client private keys are never stored; they are returned to the caller to
//! be embedded in the client artifact.
//!
//! There is no revocation. Regenerating the root invalidates every client
//! issued under the previous one.

pub mod issue;
pub mod store;

pub use store::{CertStore, IssuedClient};

use crate::{Error, Result};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509};

/// Name reserved for the root identity files.
pub const ROOT_NAME: &str = "root";

/// Extension of persisted certificates.
pub const CERT_EXTENSION: &str = "crt";

/// Extension of persisted private keys.
pub const KEY_EXTENSION: &str = "key";

/// A certificate together with its private key.
///
/// # Security
///
/// The private key should be treated as sensitive data. Avoid logging or
/// exposing [`Identity`] instances.
pub struct Identity {
    /// X.509 certificate.
    pub certificate: X509,
    /// Private key matching the certificate's public key.
    pub private_key: PKey<Private>,
}

impl Identity {
    /// Checks that `cert` carries a valid signature by this identity's key.
    pub fn verify_issued(&self, cert: &X509Ref) -> Result<bool> {
        cert.verify(&self.private_key)
            .map_err(|e| Error::Signing(format!("Failed to verify certificate: {}", e)))
    }

    /// Checks that the private key matches the certificate's public key.
    pub fn key_matches_certificate(&self) -> Result<bool> {
        let public = self.certificate.public_key().map_err(|e| {
            Error::Signing(format!(
                "Failed to extract public key from certificate: {}",
                e
            ))
        })?;
        Ok(self.private_key.public_eq(&public))
    }

    /// PEM encoding of the certificate.
    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_pem()
            .map_err(|e| Error::Signing(format!("Failed to encode certificate: {}", e)))
    }
}

/// Rejects labels that would collide with the root files or escape the
/// store directory.
pub fn validate_label(label: &str) -> Result<()> {
    let reserved = label == ROOT_NAME || label == "." || label == "..";
    let unsafe_chars = label
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c == ':');

    if label.is_empty() || reserved || unsafe_chars {
        return Err(Error::InvalidLabel(label.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_label() {
        assert!(validate_label("linux-amd64-1760000000").is_ok());
        assert!(validate_label("client.v2").is_ok());

        for bad in ["", "root", ".", "..", "a/b", "a\\b", "c:x", "nul\0"] {
            assert!(
                matches!(validate_label(bad), Err(Error::InvalidLabel(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
