use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the image described by the given profile
    Apply(ApplyArgs),

    /// Validate the given YAML profile
    Validate(ValidateArgs),

    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

impl Commands {
    /// Log level requested by the command; completions stay quiet.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Apply(opts) => opts.log_level,
            Self::Validate(opts) => opts.log_level,
            Self::Completions(_) => LogLevel::Error,
        }
    }
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Path to the YAML file defining the profile
    #[arg(short, long, default_value = "envstrap.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,

    /// Write the build result as YAML to this file
    #[arg(long, value_name = "FILE")]
    pub result: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the YAML file to validate
    #[arg(short, long, default_value = "envstrap.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Log levels for controlling the verbosity of logging output.
///
/// Maps directly to the levels of the `tracing` crate. Specifying
/// `--log-level debug` also logs the generated build files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
