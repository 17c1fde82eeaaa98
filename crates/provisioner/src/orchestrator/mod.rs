//! Multi-target client builds.
//!
//! A build acquires the root identity once, then fans out one task per
//! target on a dedicated thread pool. Each task:
//!
//! 1. Issues a client identity labelled `<os>-<arch>-<unix-nanos>`
//! 2. Runs the [`Compiler`] for the target
//! 3. Attaches the client key, client certificate and root certificate to the
//!    binary with an [`Appender`]
//! 4. Optionally packages the binary into a ZIP archive
//!
//! A failing task records its failure in its own slot; the other targets
//! continue. Directory setup and root acquisition failures abort the build.
//!
//! # Examples
//!
//! ```no_run
//! use provisioner::{BuildSettings, Orchestrator, Settings};
//!
//! let settings = Settings::resolve(None)?;
//! let build = BuildSettings::builder()
//!     .output_dir(settings.default_output_dir())
//!     .server_ip("10.0.0.1".parse()?)
//!     .build()?;
//!
//! let report = Orchestrator::new(settings).build(&build)?;
//! report.log_summary();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compiler;
pub mod dirs;
pub mod package;
pub mod report;
pub mod target;
pub mod workdir;

pub use compiler::{CommandCompiler, Compiler};
pub use dirs::{AllowAll, ConfirmDirectory, Refuse};
pub use report::{BuildReport, CompletionLedger, FailureStage, TargetOutcome, TargetStatus};
pub use target::{default_targets, BuildTarget, TargetArch, TargetOs};
pub use workdir::WorkingDirGuard;

use crate::appender::{AppendIndex, Appender};
use crate::builder::BuildSettings;
use crate::ca::{CertStore, Identity, IssuedClient};
use crate::compression::Compression;
use crate::config::Settings;
use crate::{Error, Result};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Entry holding the client's PEM private key.
pub const CLIENT_KEY_ENTRY: &str = "client.key";

/// Entry holding the client's PEM certificate.
pub const CLIENT_CERT_ENTRY: &str = "client.crt";

/// Entry holding the root PEM certificate.
pub const ROOT_CERT_ENTRY: &str = "root.crt";

/// Runs builds for one settings root.
pub struct Orchestrator {
    settings: Settings,
    compiler: Box<dyn Compiler>,
    confirm: Box<dyn ConfirmDirectory>,
    organization: Option<String>,
}

impl Orchestrator {
    /// Orchestrator using `go build` and refusing to create directories
    /// outside the settings root.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            compiler: Box::new(CommandCompiler::go()),
            confirm: Box::new(Refuse),
            organization: None,
        }
    }

    pub fn compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    pub fn confirm_with(mut self, confirm: impl ConfirmDirectory + 'static) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    /// Overrides the certificate subject organization.
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds every target in `build`.
    ///
    /// Output and certificate directories are prepared and the root identity
    /// acquired from the caller's working directory. The process working
    /// directory is then moved to the client source directory while targets
    /// compile, and restored on every exit path.
    ///
    /// # Errors
    ///
    /// Returns an error only if the output or certificate directory cannot be
    /// prepared or the root identity cannot be acquired. Per-target failures
    /// are reported in the [`BuildReport`].
    pub fn build(&self, build: &BuildSettings) -> Result<BuildReport> {
        let output_dir = build.output_dir();
        if !output_dir.is_absolute() {
            return Err(Error::Config(format!(
                "Output directory must be absolute: {}",
                output_dir.display()
            )));
        }
        dirs::ensure_dir(
            output_dir,
            Some(self.settings.settings_dir()),
            self.confirm.as_ref(),
        )?;

        let mut store = CertStore::prepare(&self.settings, self.confirm.as_ref())?;
        if let Some(organization) = &self.organization {
            store = store.with_organization(organization.clone());
        }

        if build.force_new_cert() {
            warn!("Regenerating root certificate; previously built clients will no longer authenticate");
        }
        let root = store.load_or_issue_root(build.server_ips(), build.force_new_cert())?;
        let root_pem = root.certificate_pem()?;

        let targets = build.targets();
        let ledger = CompletionLedger::new(targets.len());
        if targets.is_empty() {
            return ledger.into_report();
        }

        let output_locks = output_locks(build);
        let labels = LabelClock::default();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(targets.len())
            .thread_name(|i| format!("build-{}", i))
            .build()
            .map_err(|e| Error::Io(io::Error::other(e)))?;

        let _guard = WorkingDirGuard::enter(self.settings.client_source())?;

        info!(
            targets = targets.len(),
            output = %output_dir.display(),
            "Starting build"
        );

        let job = TargetJob {
            orchestrator: self,
            build,
            store: &store,
            root: &root,
            root_pem: &root_pem,
            labels: &labels,
        };

        pool.scope(|scope| {
            for (index, target) in targets.iter().copied().enumerate() {
                let job = &job;
                let ledger = &ledger;
                let lock = Arc::clone(&output_locks[index]);
                scope.spawn(move |_| {
                    let _serialized = lock.lock();
                    let outcome = job.run(target);
                    debug!(%target, success = outcome.is_success(), "Target finished");
                    ledger.complete(index, outcome);
                });
            }
        });

        let report = ledger.into_report()?;
        report.log_summary();
        Ok(report)
    }
}

/// Shared, read-only state of one build's tasks.
struct TargetJob<'a> {
    orchestrator: &'a Orchestrator,
    build: &'a BuildSettings,
    store: &'a CertStore,
    root: &'a Identity,
    root_pem: &'a [u8],
    labels: &'a LabelClock,
}

impl TargetJob<'_> {
    fn run(&self, target: BuildTarget) -> TargetOutcome {
        let label = format!("{}-{}", target, self.labels.next());
        let client = match self.store.issue_client(&label, self.root) {
            Ok(client) => client,
            Err(e) => return TargetOutcome::failed(target, FailureStage::Identity, &e),
        };

        let binary = self.build.output_path(&target);
        if let Err(e) = self.orchestrator.compiler.compile(&target, &binary) {
            return TargetOutcome::failed(target, FailureStage::Compile, &e);
        }

        let compression = if self.build.compress() {
            Compression::Gzip(self.build.compression_level())
        } else {
            Compression::None
        };
        if let Err(e) = attach_identity(&binary, &client, self.root_pem, compression) {
            return TargetOutcome::failed(target, FailureStage::Attach, &e);
        }

        let archive = if self.build.compress() {
            match package::package_binary(&binary, self.build.compression_level()) {
                Ok(archive) => Some(archive),
                Err(e) => return TargetOutcome::failed(target, FailureStage::Package, &e),
            }
        } else {
            None
        };

        info!(%target, binary = %binary.display(), label = %label, "Built client");
        TargetOutcome {
            target,
            status: TargetStatus::Built {
                binary,
                label,
                archive,
            },
        }
    }
}

/// Appends the client credentials and the root certificate to `binary`.
pub fn attach_identity(
    binary: &Path,
    client: &IssuedClient,
    root_pem: &[u8],
    compression: Compression,
) -> Result<AppendIndex> {
    let appender = Appender::open(binary, compression)?;
    appender.append_reader(
        client.private_key_pem.expose_secret().as_slice(),
        CLIENT_KEY_ENTRY,
    )?;
    appender.append_reader(client.certificate_pem.as_slice(), CLIENT_CERT_ENTRY)?;
    appender.append_reader(root_pem, ROOT_CERT_ENTRY)?;

    let index = appender.index()?;
    appender.close()?;
    Ok(index)
}

/// One lock per task; tasks writing the same output file share a lock.
fn output_locks(build: &BuildSettings) -> Vec<Arc<Mutex<()>>> {
    let mut by_path: HashMap<PathBuf, Arc<Mutex<()>>> = HashMap::new();
    build
        .targets()
        .iter()
        .map(|target| {
            let lock = by_path.entry(build.output_path(target)).or_default();
            Arc::clone(lock)
        })
        .collect()
}

/// Unix-nanosecond timestamps, strictly increasing within one build.
#[derive(Default)]
struct LabelClock {
    last: Mutex<i128>,
}

impl LabelClock {
    fn next(&self) -> i128 {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut last = self.last.lock();
        *last = now.max(*last + 1);
        *last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_label_clock_is_strictly_increasing() {
        let clock = LabelClock::default();
        let mut previous = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_duplicate_targets_share_lock() {
        let target: BuildTarget = "linux-amd64".parse().unwrap();
        let other: BuildTarget = "linux-arm64".parse().unwrap();
        let build = BuildSettings::builder()
            .output_dir(std::env::temp_dir())
            .targets([target, other, target])
            .build()
            .unwrap();

        let locks = output_locks(&build);
        assert_eq!(locks.len(), 3);
        assert!(Arc::ptr_eq(&locks[0], &locks[2]));
        assert!(!Arc::ptr_eq(&locks[0], &locks[1]));
    }

    #[test]
    fn test_attach_identity_entries() {
        let dir = tempdir().unwrap();
        let store = CertStore::new(dir.path()).with_organization("provisioner-test");
        let root = store.issue_root(&[]).unwrap();
        let client = store.issue_client("linux-amd64-1", &root).unwrap();
        let root_pem = root.certificate_pem().unwrap();

        let binary = dir.path().join("app-linux-amd64");
        fs::write(&binary, b"\x7fELF").unwrap();

        let index = attach_identity(&binary, &client, &root_pem, Compression::gzip_if(true)).unwrap();
        let names: Vec<_> = index.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [CLIENT_KEY_ENTRY, CLIENT_CERT_ENTRY, ROOT_CERT_ENTRY]);

        let cert = appender::extract(&binary, CLIENT_CERT_ENTRY)
            .unwrap()
            .into_bytes()
            .unwrap();
        assert_eq!(cert, client.certificate_pem);

        let root_out = appender::extract(&binary, ROOT_CERT_ENTRY)
            .unwrap()
            .into_bytes()
            .unwrap();
        assert_eq!(root_out, root_pem);

        assert_eq!(&fs::read(&binary).unwrap()[..4], b"\x7fELF");
    }
}
