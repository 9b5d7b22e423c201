//! Build outcome types.
//!
//! A build ends in exactly one [`BuildResult`]: either a [`BuiltImage`] or a
//! [`BuildFailure`] naming the step that failed, the typed [`BuildError`]
//! and the raw diagnostic text of the tool that failed. A failure never
//! carries an image reference.

use std::fmt;

use serde::Serialize;

use crate::engine::Inventory;
use crate::image::{Digest, ImageId};
use crate::layer::LayerStack;
use crate::step::Step;

/// Failure taxonomy of the provisioning sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum BuildError {
    /// The base image could not be retrieved.
    #[error("base image unavailable: {image}")]
    BaseImageUnavailable { image: String },

    /// The OS package index could not be refreshed.
    #[error("failed to refresh system package index after {attempts} attempt(s)")]
    SystemPackageIndex { attempts: u32 },

    /// A system package could not be installed.
    #[error("failed to install system package '{package}'")]
    SystemPackageInstall { package: String },

    /// The language-level installer could not be upgraded.
    #[error("failed to upgrade the package installer")]
    InstallerUpgrade,

    /// A manifest entry could not be installed.
    #[error("failed to install dependency '{entry}'{}", .line.map(|l| format!(" (manifest line {})", l)).unwrap_or_default())]
    DependencyInstall { entry: String, line: Option<usize> },

    /// A step exceeded its wall-clock budget.
    #[error("step {step} exceeded its budget of {budget_secs}s")]
    StepTimeout { step: Step, budget_secs: u64 },

    /// The container engine itself failed (missing binary, commit failure, ...).
    #[error("container engine error: {message}")]
    Engine { message: String },
}

impl BuildError {
    /// Returns true for failures that may succeed when the step is re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SystemPackageIndex { .. })
    }
}

/// A failed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildFailure {
    step_index: usize,
    step: Step,
    error: BuildError,
    diagnostic: String,
}

impl BuildFailure {
    pub fn new(step: Step, error: BuildError, diagnostic: impl Into<String>) -> Self {
        Self {
            step_index: step.index(),
            step,
            error,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// 1-based index of the failing step.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn error(&self) -> &BuildError {
        &self.error
    }

    /// Raw output of the tool that failed.
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({}) failed: {}", self.step_index, self.step, self.error)
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A successfully provisioned image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltImage {
    /// Content-addressable id of the final layer.
    pub image: ImageId,
    /// Tag applied to the final image, if one was configured.
    pub tag: Option<String>,
    /// Fingerprint of the base reference, system package set and manifest.
    pub inputs: Digest,
    pub layers: LayerStack,
    pub inventory: Inventory,
}

/// Terminal outcome of one invocation of the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BuildResult {
    Success(BuiltImage),
    Failure(BuildFailure),
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The final image reference; `None` for failed builds.
    pub fn image(&self) -> Option<&ImageId> {
        match self {
            Self::Success(built) => Some(&built.image),
            Self::Failure(_) => None,
        }
    }

    pub fn built(&self) -> Option<&BuiltImage> {
        match self {
            Self::Success(built) => Some(built),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&BuildFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<BuiltImage, BuildFailure> {
        match self {
            Self::Success(built) => Ok(built),
            Self::Failure(failure) => Err(failure),
        }
    }
}
