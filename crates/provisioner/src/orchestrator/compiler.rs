//! Cross-compiler collaborator.

use super::BuildTarget;
use crate::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Produces one binary for one target.
///
/// Implementations are invoked concurrently from the build pool, once per
/// target, and must not share mutable state between calls.
pub trait Compiler: Send + Sync {
    /// Builds the client for `target`, writing the executable to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] carrying the compiler's diagnostic.
    fn compile(&self, target: &BuildTarget, output: &Path) -> Result<()>;
}

/// Runs an external program once per target.
///
/// Arguments may contain the placeholders `{output}`, `{os}`, `{arch}` and
/// `{target}`. The target's OS and architecture are also passed through the
/// environment variables configured with [`CommandCompiler::target_env`].
///
/// # Examples
///
/// ```
/// use provisioner::orchestrator::CommandCompiler;
///
/// let cargo = CommandCompiler::new("cargo")
///     .args(["build", "--release", "--target-dir", "{output}.d"])
///     .target_env("TARGET_OS", "TARGET_ARCH");
/// # let _ = cargo;
/// ```
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: OsString,
    args: Vec<String>,
    env: Vec<(OsString, OsString)>,
    os_var: Option<String>,
    arch_var: Option<String>,
    current_dir: Option<PathBuf>,
}

impl CommandCompiler {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            os_var: None,
            arch_var: None,
            current_dir: None,
        }
    }

    /// `go build -a -o {output}` with `GOOS`, `GOARCH` and `CGO_ENABLED=0`.
    pub fn go() -> Self {
        Self::new("go")
            .args(["build", "-a", "-o", "{output}"])
            .env("CGO_ENABLED", "0")
            .target_env("GOOS", "GOARCH")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets a fixed environment variable for every invocation.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Names the variables receiving the target OS and architecture.
    pub fn target_env(mut self, os_var: impl Into<String>, arch_var: impl Into<String>) -> Self {
        self.os_var = Some(os_var.into());
        self.arch_var = Some(arch_var.into());
        self
    }

    /// Runs the compiler from `dir` instead of the process working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn expand(&self, arg: &str, target: &BuildTarget, output: &Path) -> String {
        arg.replace("{output}", &output.to_string_lossy())
            .replace("{os}", target.os.as_str())
            .replace("{arch}", target.arch.as_str())
            .replace("{target}", &target.to_string())
    }

    fn command(&self, target: &BuildTarget, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| self.expand(a, target, output)));
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(var) = &self.os_var {
            cmd.env(var, target.os.as_str());
        }
        if let Some(var) = &self.arch_var {
            cmd.env(var, target.arch.as_str());
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, target: &BuildTarget, output: &Path) -> Result<()> {
        let mut cmd = self.command(target, output);
        debug!(%target, command = ?cmd, "Running compiler");

        let result = cmd.output().map_err(|e| Error::Compile {
            target: target.to_string(),
            diagnostic: format!("failed to run {}: {}", self.program.to_string_lossy(), e),
        })?;

        if !result.status.success() {
            let mut diagnostic = String::from_utf8_lossy(&result.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&result.stdout);
            if !stdout.trim().is_empty() {
                if !diagnostic.is_empty() {
                    diagnostic.push('\n');
                }
                diagnostic.push_str(stdout.trim());
            }
            if diagnostic.is_empty() {
                diagnostic = format!("compiler exited with {}", result.status);
            }
            return Err(Error::Compile {
                target: target.to_string(),
                diagnostic,
            });
        }

        if !output.is_file() {
            return Err(Error::Compile {
                target: target.to_string(),
                diagnostic: format!("compiler produced no file at {}", output.display()),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{TargetArch, TargetOs};

    fn target() -> BuildTarget {
        BuildTarget::new(TargetOs::Windows, TargetArch::Amd64)
    }

    #[test]
    fn test_placeholders_expand() {
        let compiler = CommandCompiler::new("true");
        let out = Path::new("/tmp/out/app-windows-amd64.exe");
        assert_eq!(
            compiler.expand("-o={output}", &target(), out),
            "-o=/tmp/out/app-windows-amd64.exe"
        );
        assert_eq!(
            compiler.expand("{os}/{arch}:{target}", &target(), out),
            "windows/amd64:windows-amd64"
        );
    }

    #[test]
    fn test_go_preset_sets_env() {
        let cmd = CommandCompiler::go().command(&target(), Path::new("/tmp/x.exe"));
        let envs: Vec<_> = cmd
            .get_envs()
            .map(|(k, v)| (k.to_os_string(), v.map(|v| v.to_os_string())))
            .collect();

        assert!(envs.contains(&("GOOS".into(), Some("windows".into()))));
        assert!(envs.contains(&("GOARCH".into(), Some("amd64".into()))));
        assert!(envs.contains(&("CGO_ENABLED".into(), Some("0".into()))));

        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["build", "-a", "-o", "/tmp/x.exe"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_reports_stderr() {
        let compiler = CommandCompiler::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = compiler
            .compile(&target(), Path::new("/nonexistent/out"))
            .unwrap_err();

        match err {
            Error::Compile { target, diagnostic } => {
                assert_eq!(target, "windows-amd64");
                assert_eq!(diagnostic, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = CommandCompiler::new("true");
        let result = compiler.compile(&target(), &dir.path().join("never-written"));
        assert!(matches!(result, Err(Error::Compile { .. })));
    }

    #[test]
    fn test_missing_program_is_compile_error() {
        let compiler = CommandCompiler::new("definitely-not-a-real-compiler-binary");
        let result = compiler.compile(&target(), Path::new("out"));
        assert!(matches!(result, Err(Error::Compile { .. })));
    }
}
