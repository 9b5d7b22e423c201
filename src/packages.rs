//! System package set and OS package manager front-ends.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::EnvstrapError;

/// Validates a package identifier passed to a package manager.
///
/// Identifiers are passed as separate arguments, so the only concern is
/// that a name cannot be mistaken for an option.
pub(crate) fn validate_package_name(name: &str, label: &str) -> Result<(), EnvstrapError> {
    if name.is_empty() {
        return Err(EnvstrapError::Validation(format!("{} name must not be empty", label)));
    }
    if name.starts_with('-') {
        return Err(EnvstrapError::Validation(format!(
            "{} name '{}' must not start with '-'",
            label, name
        )));
    }
    if name.chars().any(|c| c.is_whitespace()) {
        return Err(EnvstrapError::Validation(format!(
            "{} name '{}' must not contain whitespace",
            label, name
        )));
    }
    Ok(())
}

/// Set of OS-level packages installed in step 3.
///
/// Order-insensitive and duplicate-free; iteration is sorted so rendered
/// commands are identical across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SystemPackageSet(BTreeSet<String>);

impl SystemPackageSet {
    /// Builds a set from `names`, trimming whitespace and collapsing duplicates.
    pub fn new<I, S>(names: I) -> Result<Self, EnvstrapError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for name in names {
            let name = name.as_ref().trim();
            validate_package_name(name, "system package")?;
            set.insert(name.to_string());
        }
        Ok(Self(set))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl TryFrom<Vec<String>> for SystemPackageSet {
    type Error = EnvstrapError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(names)
    }
}

impl From<SystemPackageSet> for Vec<String> {
    fn from(set: SystemPackageSet) -> Self {
        set.0.into_iter().collect()
    }
}

static APT_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^E: (?:Unable to locate package (?P<a>\S+)|Package '(?P<b>[^']+)' has no installation candidate|Version '[^']*' for '(?P<c>[^']+)' was not found)",
    )
    .expect("apt failure pattern is valid")
});

static DNF_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:No match for argument|Unable to find a match):\s*(?P<a>\S+)")
        .expect("dnf failure pattern is valid")
});

static APK_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?P<a>\S+) \(no such package\)").expect("apk failure pattern is valid")
});

/// OS-level package manager available inside the base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SystemPackageManager {
    /// Debian / Ubuntu `apt-get` (default)
    #[default]
    Apt,
    /// Fedora / RHEL `dnf`
    Dnf,
    /// Alpine `apk`
    Apk,
}

impl SystemPackageManager {
    /// Command that refreshes the package index.
    pub fn refresh_command(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Apt => &["apt-get", "update"],
            Self::Dnf => &["dnf", "makecache", "-y"],
            Self::Apk => &["apk", "update"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Non-interactive install command for `packages`.
    pub fn install_command(&self, packages: &[String]) -> Vec<String> {
        let prefix: &[&str] = match self {
            Self::Apt => &["apt-get", "install", "-y", "--no-install-recommends"],
            Self::Dnf => &["dnf", "install", "-y", "--setopt=install_weak_deps=False"],
            Self::Apk => &["apk", "add"],
        };
        let mut argv: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        argv.extend(packages.iter().cloned());
        argv
    }

    /// Environment that keeps the package manager from prompting.
    pub fn noninteractive_env(&self) -> Vec<(String, String)> {
        match self {
            Self::Apt => vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())],
            Self::Dnf | Self::Apk => Vec::new(),
        }
    }

    /// Command that lists installed packages as `name<TAB>version` lines.
    pub fn query_command(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            Self::Apt => &["dpkg-query", "-W", "-f", "${Package}\t${Version}\n"],
            Self::Dnf => &["rpm", "-qa", "--qf", "%{NAME}\t%{VERSION}-%{RELEASE}\n"],
            Self::Apk => &["apk", "list", "--installed"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Parses the output of [`query_command`](Self::query_command).
    pub fn parse_query_line(&self, line: &str) -> Option<(String, String)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self {
            Self::Apt | Self::Dnf => {
                let (name, version) = line.split_once('\t')?;
                Some((name.to_string(), version.to_string()))
            }
            // e.g. "git-2.43.0-r0 x86_64 {git} (GPL-2.0-only) [installed]"
            Self::Apk => {
                let full = line.split_whitespace().next()?;
                // "<name>-<version>-r<rel>": the name itself may contain '-'
                let mut parts = full.rsplitn(3, '-');
                let release = parts.next()?;
                let version = parts.next()?;
                let name = parts.next()?;
                Some((name.to_string(), format!("{}-{}", version, release)))
            }
        }
    }

    /// Names the package responsible for an install failure.
    ///
    /// Falls back to the first requested package when the diagnostic does
    /// not name one.
    pub fn failed_package(&self, diagnostic: &str, requested: &[String]) -> String {
        let pattern = match self {
            Self::Apt => &*APT_FAILURE,
            Self::Dnf => &*DNF_FAILURE,
            Self::Apk => &*APK_FAILURE,
        };
        pattern
            .captures(diagnostic)
            .and_then(|caps| {
                ["a", "b", "c"]
                    .iter()
                    .find_map(|group| caps.name(group))
                    .map(|m| m.as_str().to_string())
            })
            .or_else(|| requested.first().cloned())
            .unwrap_or_default()
    }
}
