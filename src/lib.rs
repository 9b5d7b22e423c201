pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod packages;
pub mod privilege;
pub mod provisioner;
pub mod result;
pub mod step;
pub mod toolchain;

pub use error::EnvstrapError;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::executor::CommandExecutor;
use crate::provisioner::Provisioner;
use crate::result::BuildResult;

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Writes `result` as YAML to `path`.
fn write_result(result: &BuildResult, path: &camino::Utf8Path) -> Result<()> {
    let yaml = serde_yaml::to_string(result).context("failed to serialize build result")?;
    fs::write(path, yaml).with_context(|| format!("failed to write build result to {}", path))?;
    info!("build result written to {}", path);
    Ok(())
}

/// Loads, validates and builds the profile given in `opts`.
///
/// Returns the build result on success. A failed build is returned as an
/// error carrying the failing step and the tool diagnostic; the result file,
/// if requested, is written either way.
pub fn run_apply(opts: &cli::ApplyArgs, executor: Arc<dyn CommandExecutor>) -> Result<BuildResult> {
    let profile = config::load_profile(opts.file.as_path())
        .with_context(|| format!("failed to load profile from {}", opts.file))?;
    profile.validate().context("profile validation failed")?;

    let engine = profile.engine.as_engine(executor);
    let provisioner = Provisioner::new(engine.as_ref(), profile.provision_config());
    let result = provisioner.build(&profile.base, &profile.system_packages, &profile.manifest);

    if let Some(path) = &opts.result {
        write_result(&result, path)?;
    }

    if let Some(failure) = result.failure() {
        anyhow::bail!("{}\n{}", failure, failure.diagnostic());
    }
    Ok(result)
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let profile = config::load_profile(opts.file.as_path())?;
    profile.validate().context("profile validation failed")?;
    info!("validation successful:\n{:#?}", profile);
    Ok(())
}
