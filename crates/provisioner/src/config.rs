//! Settings root resolution and the optional build configuration file.

use crate::orchestrator::BuildTarget;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Application name used for directories and certificate subjects.
pub const APP_NAME: &str = "provisioner";

/// Subdirectory of the settings root holding the CA files.
pub const CERT_DIR: &str = "cert";

/// Optional file in the settings root supplying build defaults.
pub const CONFIG_FILE: &str = "build-config.json";

const BUILD_DIR: &str = "build";

/// Process-wide settings passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct Settings {
    settings_dir: PathBuf,
    privileged: bool,
    client_source_dir: Option<PathBuf>,
}

impl Settings {
    /// Settings rooted at `settings_dir`, unprivileged, building in the
    /// current directory.
    ///
    /// A relative root is anchored at the current directory now, so later
    /// changes of the working directory do not move it.
    pub fn new(settings_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_dir: anchor(settings_dir.into()),
            privileged: false,
            client_source_dir: None,
        }
    }

    /// Resolves the settings root for this process.
    ///
    /// An explicit directory wins; otherwise the platform default for the
    /// current privilege level is used.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let privileged = is_superuser();
        let settings_dir = match explicit {
            Some(dir) => anchor(dir),
            None => default_settings_dir(privileged)?,
        };

        debug!(dir = %settings_dir.display(), privileged, "Resolved settings root");
        Ok(Self {
            settings_dir,
            privileged,
            client_source_dir: None,
        })
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Directory the compiler is run from. Defaults to the current directory.
    pub fn client_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.client_source_dir = Some(dir.into());
        self
    }

    pub fn settings_dir(&self) -> &Path {
        &self.settings_dir
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.settings_dir.join(CERT_DIR)
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn client_source(&self) -> Option<&Path> {
        self.client_source_dir.as_deref()
    }

    /// Default location for built clients.
    pub fn default_output_dir(&self) -> PathBuf {
        if self.privileged {
            if let Some(dir) = privileged_output_dir() {
                return dir;
            }
        }
        self.settings_dir.join(BUILD_DIR)
    }

    /// Loads `build-config.json` from the settings root.
    ///
    /// A missing file yields the empty configuration.
    pub fn load_build_config(&self) -> Result<BuildConfigFile> {
        let path = self.settings_dir.join(CONFIG_FILE);
        match fs::read(&path) {
            Ok(data) => {
                let mut config: BuildConfigFile = serde_json::from_slice(&data)?;
                // Relative output locations are taken from the settings root.
                if let Some(dir) = config.output_location.take() {
                    config.output_location = Some(self.settings_dir.join(dir));
                }
                debug!(path = %path.display(), "Loaded build configuration");
                Ok(config)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BuildConfigFile::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Build defaults read from [`CONFIG_FILE`]. Command-line values win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildConfigFile {
    pub output_location: Option<PathBuf>,
    pub output_prefix: Option<String>,
    pub server_ips: Vec<IpAddr>,
    pub targets: Vec<BuildTarget>,
    pub compress: Option<bool>,
}

/// Joins a relative path onto the current directory.
fn anchor(dir: PathBuf) -> PathBuf {
    if dir.is_absolute() {
        return dir;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(dir),
        Err(_) => dir,
    }
}

#[cfg(unix)]
fn default_settings_dir(privileged: bool) -> Result<PathBuf> {
    if privileged {
        return Ok(PathBuf::from("/etc").join(APP_NAME));
    }
    user_data_dir()
}

#[cfg(windows)]
fn default_settings_dir(privileged: bool) -> Result<PathBuf> {
    if privileged {
        if let Some(base) = program_data() {
            return Ok(base.join(APP_NAME));
        }
    }
    user_data_dir()
}

#[cfg(not(any(unix, windows)))]
fn default_settings_dir(_privileged: bool) -> Result<PathBuf> {
    user_data_dir()
}

fn user_data_dir() -> Result<PathBuf> {
    directories_next::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| Error::Config("Unable to determine a home directory".into()))
}

#[cfg(unix)]
fn privileged_output_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/var").join(APP_NAME).join(BUILD_DIR))
}

#[cfg(windows)]
fn privileged_output_dir() -> Option<PathBuf> {
    program_data().map(|base| base.join(APP_NAME).join(BUILD_DIR))
}

#[cfg(not(any(unix, windows)))]
fn privileged_output_dir() -> Option<PathBuf> {
    None
}

#[cfg(windows)]
fn program_data() -> Option<PathBuf> {
    std::env::var_os("ProgramData").map(PathBuf::from)
}

/// Whether the process runs with superuser rights.
#[cfg(unix)]
pub fn is_superuser() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_superuser() -> bool {
    false
}

/// Short host name embedded in certificate subjects.
pub fn host_identifier() -> String {
    let from_env = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.trim().is_empty());

    let name = from_env
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    // Keep only the first label of a fully qualified name.
    name.split('.').next().unwrap_or(&name).to_string()
}
