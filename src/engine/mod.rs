//! Container engine abstraction.
//!
//! The provisioner never mutates an image: every step asks the engine for a
//! new layer on top of a parent and receives the new layer's id. This module
//! provides:
//! - [`ContainerEngine`]: the operations the provisioner needs from an engine
//! - [`StepRequest`]: one rendered step, ready to be layered onto a parent
//! - [`EngineError`]: engine failures, split by how the provisioner maps them
//! - [`Inventory`]: installed package versions read back from the final image
//! - [`CliEngine`]: docker/podman driven through their command-line clients

mod args;
mod cli;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::image::{BaseImage, ImageId};
use crate::step::StepAction;
use crate::toolchain::StepCommand;

pub use args::{CommandArgsBuilder, FlagValueStyle};
pub use cli::CliEngine;

/// Supported command-line engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EngineKind {
    Docker,
    Podman,
}

impl EngineKind {
    /// Name of the client binary.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// A host file made visible to a single step only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Regular file on the host.
    pub source: Utf8PathBuf,
    /// Absolute path inside the build.
    pub target: String,
}

/// A value handed to a single step as a secret file.
///
/// The step reads it from `/run/secrets/<id>`; it is never written to a
/// layer or to the image history.
#[derive(Clone, PartialEq, Eq)]
pub struct BuildSecret {
    pub id: String,
    pub value: String,
}

impl fmt::Debug for BuildSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSecret")
            .field("id", &self.id)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// One step, rendered and ready to run on top of a parent layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub action: StepAction,
    pub command: StepCommand,
    /// Variables visible while the step runs but never persisted in the image.
    pub build_args: Vec<(String, String)>,
    pub mounts: Vec<BindMount>,
    pub secrets: Vec<BuildSecret>,
    /// Disable every layer and download cache for this step.
    pub no_cache: bool,
    /// Wall-clock budget for the step.
    pub budget: Option<Duration>,
}

/// Errors reported by a [`ContainerEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The command inside the build (or the engine client) exited unsuccessfully.
    #[error("command failed{}", .status.map(|s| format!(" with exit code {}", s)).unwrap_or_default())]
    CommandFailed {
        status: Option<i32>,
        diagnostic: String,
    },

    /// The step was killed after exceeding its budget.
    #[error("command timed out")]
    TimedOut { diagnostic: String },

    /// The engine could not be driven at all.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Output of the failing tool, or the error chain for [`EngineError::Other`].
    pub fn diagnostic(&self) -> String {
        match self {
            Self::CommandFailed { diagnostic, .. } | Self::TimedOut { diagnostic } => {
                diagnostic.clone()
            }
            Self::Other(err) => format!("{:#}", err),
        }
    }
}

/// Operations the provisioner needs from a container engine.
///
/// Implementations must be `Send + Sync` so an engine can be shared across
/// builds running in parallel. Separate builds share nothing but the engine.
pub trait ContainerEngine: Send + Sync {
    /// Engine name, used in logs.
    fn name(&self) -> &str;

    /// Retrieves `base` and returns the id of its top layer.
    fn pull(&self, base: &BaseImage, budget: Option<Duration>) -> Result<ImageId, EngineError>;

    /// Runs `request` on top of `parent` and returns the id of the new layer.
    ///
    /// `parent` is left untouched.
    fn run_step(&self, parent: &ImageId, request: &StepRequest) -> Result<ImageId, EngineError>;

    /// Runs `argv` in a throwaway container of `image` and returns its stdout.
    fn query(
        &self,
        image: &ImageId,
        argv: &[String],
        budget: Option<Duration>,
    ) -> Result<String, EngineError>;

    /// Applies `tag` to `image`.
    fn tag(&self, image: &ImageId, tag: &str) -> Result<(), EngineError>;

    /// Drops the working references the engine created for `images`.
    ///
    /// Called once a build has finished with every layer it no longer needs
    /// a handle on. Failures are logged, never reported.
    fn release(&self, images: &[ImageId]) {
        let _ = images;
    }
}

/// Package versions installed in a built image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    /// OS-level packages by name.
    pub system: BTreeMap<String, String>,
    /// Installed dependencies by normalized project name.
    pub dependencies: BTreeMap<String, String>,
}

impl Inventory {
    /// Version of an installed dependency, looked up by any spelling of its name.
    pub fn dependency(&self, name: &str) -> Option<&str> {
        self.dependencies
            .get(&crate::manifest::normalize_name(name))
            .map(String::as_str)
    }

    pub fn system_package(&self, name: &str) -> Option<&str> {
        self.system.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_command_name() {
        assert_eq!(EngineKind::Docker.command_name(), "docker");
        assert_eq!(EngineKind::Podman.to_string(), "podman");
    }

    #[test]
    fn test_engine_error_diagnostic() {
        let err = EngineError::CommandFailed {
            status: Some(100),
            diagnostic: "E: Unable to locate package nope".to_string(),
        };
        assert_eq!(err.to_string(), "command failed with exit code 100");
        assert_eq!(err.diagnostic(), "E: Unable to locate package nope");

        let err = EngineError::Other(anyhow::anyhow!("docker not found"));
        assert_eq!(err.diagnostic(), "docker not found");
    }

    #[test]
    fn test_inventory_lookup_normalizes_names() {
        let mut inventory = Inventory::default();
        inventory.dependencies.insert("py-yaml".to_string(), "6.0.1".to_string());
        assert_eq!(inventory.dependency("Py_YAML"), Some("6.0.1"));
        assert_eq!(inventory.dependency("missing"), None);
    }
}
