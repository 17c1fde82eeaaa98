pub mod appender;
pub mod builder;
pub mod ca;
pub mod compression;
pub mod config;
pub mod error;
pub mod orchestrator;

pub use appender::{extract, list, AppendIndex, AppendedFile, Appender, Extracted};
pub use builder::{BuildSettings, BuildSettingsBuilder};
pub use ca::{CertStore, Identity, IssuedClient};
pub use compression::{Codec, Compression, CompressionLevel};
pub use config::Settings;
pub use error::Error;
pub use orchestrator::{BuildReport, BuildTarget, Compiler, ConfirmDirectory, Orchestrator};

pub type Result<T> = std::result::Result<T, Error>;
