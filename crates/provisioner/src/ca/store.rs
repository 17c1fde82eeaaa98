//! On-disk persistence of CA identities.

use super::issue::{client_identity, root_identity};
use super::{validate_label, Identity, CERT_EXTENSION, KEY_EXTENSION, ROOT_NAME};
use crate::config::{host_identifier, Settings, APP_NAME};
use crate::orchestrator::dirs::{ensure_dir, ConfirmDirectory};
use crate::{Error, Result};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::SecretVec;
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Permissions applied to private key files on Unix.
#[cfg(unix)]
const KEY_FILE_MODE: u32 = 0o600;

/// Material handed back for a freshly issued client.
///
/// Only the certificate is persisted; the private key exists solely in this
/// value and must be embedded in the client artifact by the caller.
pub struct IssuedClient {
    /// Label the certificate was persisted under.
    pub label: String,
    /// Parsed client certificate.
    pub certificate: X509,
    /// PEM-encoded certificate, as written to `<label>.crt`.
    pub certificate_pem: Vec<u8>,
    /// PEM-encoded PKCS#8 private key.
    pub private_key_pem: SecretVec<u8>,
}

/// Directory holding the root identity and issued client certificates.
///
/// # Examples
///
/// ```no_run
/// use provisioner::ca::CertStore;
///
/// let store = CertStore::new("/etc/provisioner/cert");
/// let root = store.load_or_issue_root(&["10.0.0.1".parse()?], false)?;
/// let client = store.issue_client("linux-amd64-1", &root)?;
/// assert!(root.verify_issued(&client.certificate)?);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
    organization: String,
}

impl CertStore {
    /// Opens a store rooted at `dir`. Subjects carry `<app>-<hostname>`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            organization: format!("{}-{}", APP_NAME, host_identifier()),
        }
    }

    /// Overrides the subject organization of newly issued certificates.
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    /// Opens the store under `settings`, creating the directory if needed.
    ///
    /// The directory is created without asking when it lies under the
    /// settings root; anything else goes through `confirm`.
    pub fn prepare(settings: &Settings, confirm: &dyn ConfirmDirectory) -> Result<Self> {
        let dir = settings.cert_dir();
        ensure_dir(&dir, Some(settings.settings_dir()), confirm)?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Path of the certificate persisted under `name`.
    pub fn certificate_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, CERT_EXTENSION))
    }

    /// Path of the private key persisted under `name`.
    pub fn private_key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, KEY_EXTENSION))
    }

    /// Generates a new root identity and persists `root.key` and `root.crt`.
    ///
    /// Any previous root is overwritten, which orphans every client issued
    /// under it.
    pub fn issue_root(&self, server_ips: &[IpAddr]) -> Result<Identity> {
        let root = root_identity(&self.organization, server_ips)?;

        let key_pem = root
            .private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| Error::Signing(format!("Failed to encode private key: {}", e)))?;
        let cert_pem = root.certificate_pem()?;

        // Key first: a certificate on disk always has its key next to it.
        write_atomic(&self.private_key_path(ROOT_NAME), &key_pem, true)?;
        write_atomic(&self.certificate_path(ROOT_NAME), &cert_pem, false)?;

        info!(dir = %self.dir.display(), ips = server_ips.len(), "Issued root certificate");
        Ok(root)
    }

    /// Issues a client identity signed by `root` and persists `<label>.crt`.
    pub fn issue_client(&self, label: &str, root: &Identity) -> Result<IssuedClient> {
        validate_label(label)?;

        let client = client_identity(&self.organization, label, root)?;
        let certificate_pem = client.certificate_pem()?;
        let key_pem = client
            .private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| Error::Signing(format!("Failed to encode private key: {}", e)))?;

        write_atomic(&self.certificate_path(label), &certificate_pem, false)?;
        debug!(label, "Issued client certificate");

        Ok(IssuedClient {
            label: label.to_string(),
            certificate: client.certificate,
            certificate_pem,
            private_key_pem: SecretVec::new(key_pem),
        })
    }

    /// Loads the certificate persisted under `name`.
    pub fn read_certificate(&self, name: &str) -> Result<X509> {
        let path = self.certificate_path(name);
        let data = read_existing(&path)?;
        X509::from_pem(&data).map_err(|e| Error::decode(&path, e))
    }

    /// Loads the private key persisted under `name`.
    pub fn read_private_key(&self, name: &str) -> Result<PKey<Private>> {
        let path = self.private_key_path(name);
        let data = read_existing(&path)?;
        PKey::private_key_from_pem(&data).map_err(|e| Error::decode(&path, e))
    }

    /// Loads the persisted root identity.
    pub fn read_root(&self) -> Result<Identity> {
        let root = Identity {
            certificate: self.read_certificate(ROOT_NAME)?,
            private_key: self.read_private_key(ROOT_NAME)?,
        };

        if !root.key_matches_certificate()? {
            return Err(Error::FilesystemInconsistency(format!(
                "root key in {} does not match root certificate",
                self.dir.display()
            )));
        }
        Ok(root)
    }

    /// Returns the persisted root, issuing one when none exists or when
    /// `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemInconsistency`] if only one of `root.crt`
    /// and `root.key` exists.
    pub fn load_or_issue_root(&self, server_ips: &[IpAddr], force: bool) -> Result<Identity> {
        if force {
            return self.issue_root(server_ips);
        }

        let has_cert = self.certificate_path(ROOT_NAME).is_file();
        let has_key = self.private_key_path(ROOT_NAME).is_file();

        match (has_cert, has_key) {
            (true, true) => {
                debug!(dir = %self.dir.display(), "Reusing root certificate");
                self.read_root()
            }
            (false, false) => self.issue_root(server_ips),
            (true, false) => Err(Error::FilesystemInconsistency(format!(
                "root certificate present without its key in {}",
                self.dir.display()
            ))),
            (false, true) => Err(Error::FilesystemInconsistency(format!(
                "root key present without its certificate in {}",
                self.dir.display()
            ))),
        }
    }
}

fn read_existing(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

/// Writes `data` to a sibling temporary file and renames it over `path`.
fn write_atomic(path: &Path, data: &[u8], private: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::persistence(path, e))?;

    if private {
        restrict_permissions(tmp.as_file()).map_err(|e| Error::persistence(path, e))?;
    }

    tmp.write_all(data).map_err(|e| Error::persistence(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::persistence(path, e))?;
    tmp.persist(path)
        .map_err(|e| Error::persistence(path, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(KEY_FILE_MODE))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::tempdir;

    fn store(dir: &Path) -> CertStore {
        CertStore::new(dir).with_organization("provisioner-test")
    }

    #[test]
    fn test_root_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let issued = store.issue_root(&["127.0.0.1".parse().unwrap()]).unwrap();
        let loaded = store.read_root().unwrap();

        assert_eq!(
            issued.certificate.to_der().unwrap(),
            loaded.certificate.to_der().unwrap()
        );
        assert!(loaded.key_matches_certificate().unwrap());
        assert!(issued.private_key.public_eq(&loaded.private_key));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.issue_root(&[]).unwrap();

        let mode = fs::metadata(store.private_key_path(ROOT_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_client_persists_certificate_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let root = store.issue_root(&[]).unwrap();

        let client = store.issue_client("linux-amd64-42", &root).unwrap();
        assert!(store.certificate_path("linux-amd64-42").is_file());
        assert!(!store.private_key_path("linux-amd64-42").exists());

        let on_disk = store.read_certificate("linux-amd64-42").unwrap();
        assert!(root.verify_issued(&on_disk).unwrap());
        assert_eq!(on_disk.to_pem().unwrap(), client.certificate_pem);

        let key = PKey::private_key_from_pem(client.private_key_pem.expose_secret()).unwrap();
        assert!(key.public_eq(&on_disk.public_key().unwrap()));
    }

    #[test]
    fn test_reserved_label_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let root = store.issue_root(&[]).unwrap();
        let before = fs::read(store.certificate_path(ROOT_NAME)).unwrap();

        for label in ["root", "", "../escape", "a/b"] {
            let result = store.issue_client(label, &root);
            assert!(matches!(result, Err(Error::InvalidLabel(_))), "{label:?}");
        }

        assert_eq!(fs::read(store.certificate_path(ROOT_NAME)).unwrap(), before);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_read_missing_and_garbage() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(matches!(
            store.read_certificate("nope"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.read_private_key("nope"),
            Err(Error::NotFound(_))
        ));

        fs::write(store.certificate_path("junk"), b"not a pem").unwrap();
        fs::write(store.private_key_path("junk"), b"not a pem").unwrap();
        assert!(matches!(
            store.read_certificate("junk"),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            store.read_private_key("junk"),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_load_or_issue_reuses_and_rotates() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let first = store.load_or_issue_root(&[], false).unwrap();
        let again = store.load_or_issue_root(&[], false).unwrap();
        assert_eq!(
            first.certificate.to_der().unwrap(),
            again.certificate.to_der().unwrap()
        );

        let rotated = store.load_or_issue_root(&[], true).unwrap();
        assert_ne!(
            first.certificate.to_der().unwrap(),
            rotated.certificate.to_der().unwrap()
        );

        let client = store.issue_client("c", &rotated).unwrap();
        assert!(!first.verify_issued(&client.certificate).unwrap());
    }

    #[test]
    fn test_half_root_is_inconsistent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.issue_root(&[]).unwrap();
        fs::remove_file(store.private_key_path(ROOT_NAME)).unwrap();

        assert!(matches!(
            store.load_or_issue_root(&[], false),
            Err(Error::FilesystemInconsistency(_))
        ));
    }

    #[test]
    fn test_persistence_failure() {
        let dir = tempdir().unwrap();
        let store = store(&dir.path().join("missing"));

        assert!(matches!(
            store.issue_root(&[]),
            Err(Error::Persistence { .. })
        ));
    }
}
