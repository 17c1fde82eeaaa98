//! Build settings and their builder.
//!
//! [`BuildSettings`] is immutable once built and is shared read-only by every
//! task of a build.

use crate::compression::CompressionLevel;
use crate::config::BuildConfigFile;
use crate::orchestrator::{default_targets, BuildTarget};
use crate::{Error, Result};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Binary name prefix used when none is configured.
pub const DEFAULT_OUTPUT_PREFIX: &str = "provisioner-client-";

/// Everything one build needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    output_dir: PathBuf,
    output_prefix: String,
    compress: bool,
    compression_level: CompressionLevel,
    force_new_cert: bool,
    server_ips: Vec<IpAddr>,
    targets: Vec<BuildTarget>,
}

impl BuildSettings {
    pub fn builder() -> BuildSettingsBuilder {
        BuildSettingsBuilder::new()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn output_prefix(&self) -> &str {
        &self.output_prefix
    }

    /// Whether payloads are gzip-compressed and binaries zipped.
    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn compression_level(&self) -> CompressionLevel {
        self.compression_level
    }

    pub fn force_new_cert(&self) -> bool {
        self.force_new_cert
    }

    pub fn server_ips(&self) -> &[IpAddr] {
        &self.server_ips
    }

    /// Targets in dispatch order. Duplicates are kept.
    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    /// Where the binary for `target` is written.
    pub fn output_path(&self, target: &BuildTarget) -> PathBuf {
        self.output_dir.join(target.file_name(&self.output_prefix))
    }
}

/// Builder for [`BuildSettings`].
///
/// # Example
///
/// ```
/// use provisioner::BuildSettings;
///
/// let settings = BuildSettings::builder()
///     .output_dir("/srv/clients")
///     .output_prefix("worker-")
///     .server_ip("10.0.0.1".parse()?)
///     .target("linux-amd64".parse()?)
///     .build()?;
/// assert_eq!(settings.targets().len(), 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct BuildSettingsBuilder {
    output_dir: Option<PathBuf>,
    output_prefix: Option<String>,
    compress: bool,
    compression_level: CompressionLevel,
    force_new_cert: bool,
    server_ips: Vec<IpAddr>,
    targets: Vec<BuildTarget>,
}

impl BuildSettingsBuilder {
    pub fn new() -> Self {
        Self {
            output_dir: None,
            output_prefix: None,
            compress: true,
            compression_level: CompressionLevel::DEFAULT,
            force_new_cert: false,
            server_ips: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Set the output directory. Must be absolute.
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set the output directory only if none has been chosen yet.
    ///
    /// Call after [`apply_config`](Self::apply_config) so a configured
    /// location still wins over this default.
    pub fn default_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        if self.output_dir.is_none() {
            self.output_dir = Some(dir.as_ref().to_path_buf());
        }
        self
    }

    pub fn output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = Some(prefix.into());
        self
    }

    /// Enable or disable payload compression and ZIP packaging.
    ///
    /// Enabled by default.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the compression level (0-9) used when compression is enabled.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = CompressionLevel::new(level);
        self
    }

    /// Regenerate the root identity even if one exists.
    pub fn force_new_cert(mut self, force: bool) -> Self {
        self.force_new_cert = force;
        self
    }

    pub fn server_ip(mut self, ip: IpAddr) -> Self {
        self.server_ips.push(ip);
        self
    }

    pub fn server_ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.server_ips.extend(ips);
        self
    }

    pub fn target(mut self, target: BuildTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = BuildTarget>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Fill unset values from a configuration file.
    ///
    /// Values already set on the builder take precedence.
    pub fn apply_config(mut self, config: &BuildConfigFile) -> Self {
        if self.output_dir.is_none() {
            self.output_dir = config.output_location.clone();
        }
        if self.output_prefix.is_none() {
            self.output_prefix = config.output_prefix.clone();
        }
        if let Some(compress) = config.compress {
            self.compress = self.compress && compress;
        }
        if self.server_ips.is_empty() {
            self.server_ips = config.server_ips.clone();
        }
        if self.targets.is_empty() {
            self.targets = config.targets.clone();
        }
        self
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if:
    /// - No output directory is set
    /// - The output directory is relative
    /// - The prefix contains a path separator
    pub fn validate(&self) -> Result<()> {
        let dir = self
            .output_dir
            .as_ref()
            .ok_or_else(|| Error::Config("Output directory must be specified".into()))?;

        if !dir.is_absolute() {
            return Err(Error::Config(format!(
                "Output directory must be absolute: {}",
                dir.display()
            )));
        }

        if let Some(prefix) = &self.output_prefix {
            if prefix.contains(['/', '\\', '\0']) {
                return Err(Error::Config(format!(
                    "Output prefix must not contain path separators: {:?}",
                    prefix
                )));
            }
        }

        Ok(())
    }

    /// Validate and produce the settings. An empty target list becomes the
    /// default target set.
    pub fn build(self) -> Result<BuildSettings> {
        self.validate()?;

        let output_dir = self
            .output_dir
            .ok_or_else(|| Error::Config("Output directory must be specified".into()))?;
        let targets = if self.targets.is_empty() {
            default_targets()
        } else {
            self.targets
        };

        Ok(BuildSettings {
            output_dir,
            output_prefix: self
                .output_prefix
                .unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.to_string()),
            compress: self.compress,
            compression_level: self.compression_level,
            force_new_cert: self.force_new_cert,
            server_ips: self.server_ips,
            targets,
        })
    }
}

impl Default for BuildSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
