//! Command-line interface for the client provisioner.
//!
//! Builds identity-carrying client binaries, manages the certificate
//! authority, and inspects payloads appended to binaries.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use provisioner::ca::{CertStore, ROOT_NAME};
use provisioner::orchestrator::{AllowAll, ConfirmDirectory, TargetStatus};
use provisioner::{
    Appender, BuildSettings, BuildTarget, Compression, Orchestrator, Settings,
};
use secrecy::ExposeSecret;
use std::fs::{self, File};
use std::io::{self, BufRead, IsTerminal, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Build client binaries carrying CA-signed identities")]
struct Cli {
    /// Settings directory (default depends on platform and privileges)
    #[arg(long, global = true)]
    settings_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Create missing directories without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build client binaries for target platforms
    Build(BuildArgs),

    /// Manage the certificate authority
    #[command(subcommand)]
    Cert(CertCommand),

    /// Append a file to the end of a host binary
    Append {
        /// Host binary
        host: PathBuf,
        /// File to append
        file: PathBuf,
        /// Entry name (default: the file name)
        #[arg(long)]
        name: Option<String>,
        /// Store the payload uncompressed
        #[arg(short = 'Z', long)]
        no_compress: bool,
    },

    /// Extract an appended payload by name
    Extract {
        /// Host binary
        host: PathBuf,
        /// Entry name
        name: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List payloads appended to a host binary
    List {
        /// Host binary
        host: PathBuf,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// The folder to place output binaries (default $settings/build)
    #[arg(long)]
    output_location: Option<PathBuf>,

    /// The start of the binary names
    #[arg(long)]
    output_prefix: Option<String>,

    /// Don't compress payloads or zip binaries
    #[arg(short = 'Z', long)]
    no_compress: bool,

    /// ZIP and gzip compression level (0-9)
    #[arg(short = 'z', long, default_value = "6")]
    zip_level: u32,

    /// Regenerate the root certificate (invalidates all existing clients)
    #[arg(long)]
    force_new_cert: bool,

    /// Server IP address to include in the root certificate (repeatable)
    #[arg(long = "server-ip")]
    server_ips: Vec<IpAddr>,

    /// Target as os-arch, e.g. linux-amd64 (repeatable)
    #[arg(short, long = "target")]
    targets: Vec<BuildTarget>,

    /// Directory containing the client sources
    #[arg(long)]
    client_source: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CertCommand {
    /// Create the root certificate if it does not exist
    Root {
        /// Server IP address to include (repeatable)
        #[arg(long = "server-ip")]
        server_ips: Vec<IpAddr>,
        /// Replace an existing root
        #[arg(long)]
        force: bool,
    },

    /// Issue a client certificate signed by the root
    Client {
        /// Label the certificate is stored under
        label: String,
        /// Where to write the client private key (default: stdout)
        #[arg(long)]
        key_out: Option<PathBuf>,
    },
}

/// Asks on the terminal; refuses when stdin is not interactive.
struct TerminalPrompt;

impl ConfirmDirectory for TerminalPrompt {
    fn confirm(&self, path: &Path, existing: &Path) -> bool {
        if !io::stdin().is_terminal() {
            return false;
        }

        eprint!(
            "{} does not exist, but {} does.\nCreate intermediate folders? [y/N] ",
            path.display(),
            existing.display()
        );
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn confirm(yes: bool) -> Box<dyn ConfirmDirectory> {
    if yes {
        Box::new(AllowAll)
    } else {
        Box::new(TerminalPrompt)
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::resolve(cli.settings_dir).context("resolving settings directory")?;

    match cli.command {
        Command::Build(args) => build(settings, args, cli.yes),
        Command::Cert(cmd) => {
            cert(&settings, cmd, cli.yes)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Append {
            host,
            file,
            name,
            no_compress,
        } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("cannot derive an entry name from the file path")?,
            };

            let appender = Appender::open(&host, Compression::gzip_if(!no_compress))?;
            let entry = appender
                .append_file(&file, &name)
                .with_context(|| format!("appending {} to {}", file.display(), host.display()))?;
            appender.close()?;

            println!(
                "Appended {} at offset {} ({} bytes stored)",
                entry.name, entry.offset, entry.length
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Extract { host, name, output } => {
            let extracted = provisioner::extract(&host, &name)
                .with_context(|| format!("extracting {} from {}", name, host.display()))?;
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    extracted.copy_to(&mut file)?;
                }
                None => {
                    let stdout = io::stdout();
                    extracted.copy_to(&mut stdout.lock())?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List { host } => {
            let index = provisioner::list(&host)?;
            if index.is_empty() {
                println!("No appended payloads in {}", host.display());
            }
            for entry in index.entries() {
                println!(
                    "{:<24} {:<5} offset={:<10} length={}",
                    entry.name,
                    format!("{:?}", entry.codec).to_lowercase(),
                    entry.offset,
                    entry.length
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build(settings: Settings, args: BuildArgs, yes: bool) -> Result<ExitCode> {
    let settings = match &args.client_source {
        Some(dir) => settings.client_source_dir(absolute(dir)?),
        None => settings,
    };

    let mut builder = BuildSettings::builder()
        .compress(!args.no_compress)
        .compression_level(args.zip_level)
        .force_new_cert(args.force_new_cert)
        .server_ips(args.server_ips)
        .targets(args.targets);
    if let Some(dir) = &args.output_location {
        builder = builder.output_dir(absolute(dir)?);
    }
    if let Some(prefix) = args.output_prefix {
        builder = builder.output_prefix(prefix);
    }

    let config = settings
        .load_build_config()
        .context("loading build configuration")?;
    let build = builder
        .apply_config(&config)
        .default_output_dir(settings.default_output_dir())
        .build()?;
    debug!(
        output = %build.output_dir().display(),
        prefix = build.output_prefix(),
        targets = build.targets().len(),
        "Resolved build settings"
    );

    let orchestrator = Orchestrator::new(settings).confirm_with(BoxedConfirm(confirm(yes)));
    let report = orchestrator.build(&build).context("build aborted")?;

    for outcome in report.outcomes() {
        match &outcome.status {
            TargetStatus::Built {
                binary, archive, ..
            } => match archive {
                Some(archive) => println!("{:<16} {}", outcome.target, archive.display()),
                None => println!("{:<16} {}", outcome.target, binary.display()),
            },
            TargetStatus::Failed { stage, message } => {
                println!("{:<16} FAILED ({}): {}", outcome.target, stage, message)
            }
        }
    }

    if report.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn cert(settings: &Settings, cmd: CertCommand, yes: bool) -> Result<()> {
    let confirm = confirm(yes);
    let store = CertStore::prepare(settings, confirm.as_ref())?;

    match cmd {
        CertCommand::Root { server_ips, force } => {
            let existed = store.certificate_path(ROOT_NAME).exists();
            store.load_or_issue_root(&server_ips, force)?;
            if existed && !force {
                println!("Root certificate already exists in {}", store.dir().display());
            } else {
                println!("Root certificate written to {}", store.dir().display());
            }
        }
        CertCommand::Client { label, key_out } => {
            let root = store
                .read_root()
                .context("reading root identity (run `provisioner cert root` first)")?;
            let client = store.issue_client(&label, &root)?;

            let key = client.private_key_pem.expose_secret();
            match key_out {
                Some(path) => write_private(&path, key)?,
                None => io::stdout().write_all(key)?,
            }
            eprintln!(
                "Client certificate written to {}",
                store.certificate_path(&label).display()
            );
        }
    }
    Ok(())
}

/// Adapts a boxed prompt to the orchestrator's generic setter.
struct BoxedConfirm(Box<dyn ConfirmDirectory>);

impl ConfirmDirectory for BoxedConfirm {
    fn confirm(&self, path: &Path, existing: &Path) -> bool {
        self.0.confirm(path, existing)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    if path.exists() {
        bail!("refusing to overwrite {}", path.display());
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(data)?;
    Ok(())
}
