//! The fixed provisioning steps.

use camino::Utf8PathBuf;
use serde::Serialize;
use strum::{Display, EnumIter};

/// One of the five provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    /// Resolve and materialize the base image.
    ResolveBase,
    /// Refresh the OS package index.
    RefreshIndex,
    /// Install the system package set.
    InstallSystemPackages,
    /// Upgrade the language-level installer.
    UpgradeInstaller,
    /// Install the dependency manifest.
    InstallDependencies,
}

impl Step {
    /// 1-based position of the step in the sequence.
    pub fn index(&self) -> usize {
        match self {
            Self::ResolveBase => 1,
            Self::RefreshIndex => 2,
            Self::InstallSystemPackages => 3,
            Self::UpgradeInstaller => 4,
            Self::InstallDependencies => 5,
        }
    }
}

/// What a step asks the engine to do on top of the previous layer.
///
/// Step 1 has no action: it is the engine's `pull`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    RefreshIndex,
    InstallSystemPackages(Vec<String>),
    UpgradeInstaller,
    /// Install the manifest at `manifest` on the host.
    ///
    /// `no_cache` is always set by the provisioner; engines must not reuse
    /// a cached layer or installer download cache for this action.
    InstallManifest { manifest: Utf8PathBuf, no_cache: bool },
}

impl StepAction {
    /// The step this action belongs to.
    pub fn step(&self) -> Step {
        match self {
            Self::RefreshIndex => Step::RefreshIndex,
            Self::InstallSystemPackages(_) => Step::InstallSystemPackages,
            Self::UpgradeInstaller => Step::UpgradeInstaller,
            Self::InstallManifest { .. } => Step::InstallDependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_steps_iterate_in_index_order() {
        let indices: Vec<usize> = Step::iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_step_display_is_kebab_case() {
        assert_eq!(Step::InstallSystemPackages.to_string(), "install-system-packages");
        assert_eq!(Step::ResolveBase.to_string(), "resolve-base");
    }

    #[test]
    fn test_action_maps_to_step() {
        let action = StepAction::InstallManifest {
            manifest: "requirements.txt".into(),
            no_cache: true,
        };
        assert_eq!(action.step(), Step::InstallDependencies);
        assert_eq!(StepAction::RefreshIndex.step().index(), 2);
    }
}
