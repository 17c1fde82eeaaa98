//! Build targets: one operating system and architecture pair.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating systems the client can be cross-compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOs {
    Linux,
    Windows,
    Darwin,
    FreeBsd,
}

impl TargetOs {
    /// Name understood by the Go toolchain (`GOOS`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetOs::Linux => "linux",
            TargetOs::Windows => "windows",
            TargetOs::Darwin => "darwin",
            TargetOs::FreeBsd => "freebsd",
        }
    }

    /// Suffix appended to executables for this OS.
    pub fn executable_suffix(&self) -> &'static str {
        match self {
            TargetOs::Windows => ".exe",
            _ => "",
        }
    }
}

impl FromStr for TargetOs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(TargetOs::Linux),
            "windows" => Ok(TargetOs::Windows),
            "darwin" | "macos" => Ok(TargetOs::Darwin),
            "freebsd" => Ok(TargetOs::FreeBsd),
            other => Err(Error::Config(format!("Unknown target OS: {}", other))),
        }
    }
}

/// CPU architectures the client can be cross-compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    Amd64,
    I386,
    Arm64,
    Arm,
}

impl TargetArch {
    /// Name understood by the Go toolchain (`GOARCH`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::Amd64 => "amd64",
            TargetArch::I386 => "386",
            TargetArch::Arm64 => "arm64",
            TargetArch::Arm => "arm",
        }
    }
}

impl FromStr for TargetArch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(TargetArch::Amd64),
            "386" | "i386" => Ok(TargetArch::I386),
            "arm64" | "aarch64" => Ok(TargetArch::Arm64),
            "arm" => Ok(TargetArch::Arm),
            other => Err(Error::Config(format!("Unknown target architecture: {}", other))),
        }
    }
}

/// An immutable `{os, arch}` pair, written `os-arch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildTarget {
    pub os: TargetOs,
    pub arch: TargetArch,
}

impl BuildTarget {
    pub const fn new(os: TargetOs, arch: TargetArch) -> Self {
        Self { os, arch }
    }

    /// Output file name: `<prefix><os>-<arch>`, plus `.exe` on Windows.
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{}{}{}", prefix, self, self.os.executable_suffix())
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.arch.as_str())
    }
}

impl FromStr for BuildTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once(['-', '/'])
            .ok_or_else(|| Error::Config(format!("Target must be os-arch, got {:?}", s)))?;
        Ok(Self::new(os.parse()?, arch.parse()?))
    }
}

impl TryFrom<String> for BuildTarget {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BuildTarget> for String {
    fn from(target: BuildTarget) -> Self {
        target.to_string()
    }
}

/// Targets built when none are configured.
pub fn default_targets() -> Vec<BuildTarget> {
    vec![
        BuildTarget::new(TargetOs::Linux, TargetArch::Amd64),
        BuildTarget::new(TargetOs::Linux, TargetArch::I386),
        BuildTarget::new(TargetOs::Windows, TargetArch::Amd64),
        BuildTarget::new(TargetOs::Windows, TargetArch::I386),
        BuildTarget::new(TargetOs::Darwin, TargetArch::Amd64),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let linux = BuildTarget::new(TargetOs::Linux, TargetArch::Amd64);
        let windows = BuildTarget::new(TargetOs::Windows, TargetArch::I386);

        assert_eq!(linux.file_name("app-"), "app-linux-amd64");
        assert_eq!(windows.file_name("app-"), "app-windows-386.exe");
    }

    #[test]
    fn test_parse() {
        let target: BuildTarget = "darwin-arm64".parse().unwrap();
        assert_eq!(target, BuildTarget::new(TargetOs::Darwin, TargetArch::Arm64));

        let slash: BuildTarget = "linux/386".parse().unwrap();
        assert_eq!(slash.to_string(), "linux-386");

        assert!("linux".parse::<BuildTarget>().is_err());
        assert!("plan9-amd64".parse::<BuildTarget>().is_err());
        assert!("linux-mips".parse::<BuildTarget>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let target = BuildTarget::new(TargetOs::Windows, TargetArch::Amd64);
        let json = serde_json::to_string(&target).unwrap();
        assert_eq!(json, "\"windows-amd64\"");
        assert_eq!(serde_json::from_str::<BuildTarget>(&json).unwrap(), target);
    }

    #[test]
    fn test_default_targets() {
        let targets = default_targets();
        assert_eq!(targets.len(), 5);
        assert!(targets.iter().all(|t| t.to_string().contains('-')));
    }
}
