//! Dependency manifest.
//!
//! The manifest is handed to the installer verbatim. It is read here only to
//! fingerprint the build inputs and to attribute installer failures to the
//! entry that caused them; constraint syntax is the installer's business.

use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;

use crate::error::EnvstrapError;
use crate::image::Digest;

/// Installer options that point at another file or a local source tree.
///
/// Only the manifest itself is visible to the install step, so lines using
/// them cannot be installed.
const FILE_OPTIONS: &[&str] = &["-r", "--requirement", "-c", "--constraint", "-e", "--editable"];

/// Characters that end the project name in a requirement line.
const NAME_TERMINATORS: &[char] = &['<', '>', '=', '!', '~', ';', '[', '@', '(', ',', ' ', '\t'];

static INSTALLER_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)(?:No matching distribution found for|Could not find a version that satisfies the requirement|Failed building wheel for|Failed to build|Invalid requirement:)\s+'?(?P<req>[^'\s]+)",
    )
    .expect("installer failure pattern is valid")
});

/// Normalizes a project name the way package indexes compare them.
///
/// Case-insensitive, with runs of `-`, `_` and `.` treated as one `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !normalized.is_empty() {
            normalized.push('-');
        }
        pending_separator = false;
        normalized.extend(c.to_lowercase());
    }
    normalized
}

/// Extracts the project name from a requirement string.
fn requirement_name(requirement: &str) -> &str {
    let end = requirement
        .find(NAME_TERMINATORS)
        .unwrap_or(requirement.len());
    &requirement[..end]
}

/// One requirement line of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// 1-based line number in the manifest file.
    pub line: usize,
    /// The requirement exactly as written, without trailing comments.
    pub requirement: String,
    /// Project name, as written.
    pub name: String,
}

impl ManifestEntry {
    /// The version constraint part of the requirement, if any.
    pub fn constraint(&self) -> Option<&str> {
        let rest = self.requirement[self.name.len()..].trim();
        (!rest.is_empty()).then_some(rest)
    }
}

/// An installer option line that refers to something outside the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// 1-based line number in the manifest file.
    pub line: usize,
    pub text: String,
}

/// Returns whether `option` is one of [`FILE_OPTIONS`], in any spelling.
fn is_file_option(option: &str) -> bool {
    FILE_OPTIONS.iter().any(|flag| {
        option == *flag
            || option
                .strip_prefix(flag)
                .is_some_and(|rest| rest.starts_with('=') || (!flag.starts_with("--") && !rest.is_empty()))
    })
}

/// Ordered dependency manifest loaded from disk.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    path: Utf8PathBuf,
    entries: Vec<ManifestEntry>,
    file_references: Vec<FileReference>,
    digest: Digest,
}

impl DependencyManifest {
    /// Reads and indexes the manifest at `path`.
    pub fn load(path: &Utf8Path) -> Result<Self, EnvstrapError> {
        let bytes = fs::read(path)
            .map_err(|e| EnvstrapError::io(format!("failed to read manifest {}", path), e))?;
        let text = String::from_utf8(bytes).map_err(|_| {
            EnvstrapError::Validation(format!("manifest {} is not valid UTF-8", path))
        })?;
        let manifest = Self::parse(path, &text);
        tracing::debug!(
            path = %path,
            entries = manifest.entries.len(),
            digest = %manifest.digest,
            "loaded dependency manifest"
        );
        Ok(manifest)
    }

    /// Indexes manifest `text` that was read from `path`.
    pub fn parse(path: &Utf8Path, text: &str) -> Self {
        let mut entries = Vec::new();
        let mut file_references = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let requirement = match raw.find(" #") {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if requirement.is_empty() || requirement.starts_with('#') {
                continue;
            }
            if requirement.starts_with('-') {
                let option = requirement.split_whitespace().next().unwrap_or(requirement);
                if is_file_option(option) {
                    file_references.push(FileReference {
                        line: index + 1,
                        text: requirement.to_string(),
                    });
                }
                // other installer options are passed through untouched
                continue;
            }
            entries.push(ManifestEntry {
                line: index + 1,
                requirement: requirement.to_string(),
                name: requirement_name(requirement).to_string(),
            });
        }

        Self {
            path: path.to_owned(),
            entries,
            file_references,
            digest: Digest::compute(text.as_bytes()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lines that include other requirement files or install local trees.
    pub fn file_references(&self) -> &[FileReference] {
        &self.file_references
    }

    /// Fails if the manifest depends on files other than itself.
    pub fn ensure_self_contained(&self) -> Result<(), EnvstrapError> {
        match self.file_references.first() {
            Some(reference) => Err(EnvstrapError::Validation(format!(
                "manifest {} line {}: '{}' refers to another file; only the manifest itself is available to the installer",
                self.path, reference.line, reference.text
            ))),
            None => Ok(()),
        }
    }

    /// SHA-256 of the manifest contents.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Finds the entry for a project name, comparing normalized names.
    pub fn find(&self, name: &str) -> Option<&ManifestEntry> {
        let wanted = normalize_name(requirement_name(name.trim()));
        self.entries
            .iter()
            .find(|entry| normalize_name(&entry.name) == wanted)
    }

    /// Attributes an installer diagnostic to a manifest entry.
    ///
    /// Returns `None` when the diagnostic names nothing listed in the
    /// manifest, such as a transitive dependency or a resolver conflict.
    pub fn failed_entry(&self, diagnostic: &str) -> Option<&ManifestEntry> {
        INSTALLER_FAILURE
            .captures_iter(diagnostic)
            .find_map(|caps| self.find(&caps["req"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(text: &str) -> DependencyManifest {
        DependencyManifest::parse(Utf8Path::new("requirements.txt"), text)
    }

    #[test]
    fn test_parse_skips_blank_comment_and_option_lines() {
        let m = manifest("# pinned deps\n\nlibfoo>=1.0\n--extra-index-url https://x\nlibbar  # latest\n");
        let lines: Vec<usize> = m.entries().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![3, 5]);
        assert_eq!(m.entries()[1].requirement, "libbar");
    }

    #[test]
    fn test_entry_name_and_constraint() {
        let m = manifest("libfoo>=1.0\ntorch[cuda] == 2.3.0 ; python_version >= '3.10'\nlibbar\n");
        assert_eq!(m.entries()[0].name, "libfoo");
        assert_eq!(m.entries()[0].constraint(), Some(">=1.0"));
        assert_eq!(m.entries()[1].name, "torch");
        assert_eq!(m.entries()[2].constraint(), None);
    }

    #[test]
    fn test_empty_manifest() {
        let m = manifest("");
        assert!(m.is_empty());
        assert!(m.failed_entry("ERROR: anything").is_none());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Py_Yaml"), "py-yaml");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a--__b"), "a-b");
    }

    #[test]
    fn test_failed_entry_from_pip_diagnostic() {
        let m = manifest("libfoo>=1.0\nlib_nope==9.9\nlibbar\n");
        let diagnostic = "ERROR: Could not find a version that satisfies the requirement lib-nope==9.9 (from versions: none)\nERROR: No matching distribution found for lib-nope==9.9";
        let entry = m.failed_entry(diagnostic).unwrap();
        assert_eq!(entry.line, 2);
        assert_eq!(entry.requirement, "lib_nope==9.9");
    }

    #[test]
    fn test_failed_entry_is_none_when_no_entry_is_named() {
        let m = manifest("libfoo\nlibbar\n");
        assert!(m.failed_entry("ERROR: ResolutionImpossible").is_none());
        // a transitive dependency of libfoo
        let diagnostic = "ERROR: No matching distribution found for libbaz>=3";
        assert!(m.failed_entry(diagnostic).is_none());
    }

    #[test]
    fn test_file_references_are_collected() {
        let m = manifest(
            "-r base.txt\nlibfoo\n--constraint=pins.txt\n-e ./local\n-rextra.txt\n--extra-index-url https://x\n--require-hashes\n",
        );
        let lines: Vec<usize> = m.file_references().iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![1, 3, 4, 5]);
        assert_eq!(m.entries().len(), 1);

        let err = m.ensure_self_contained().unwrap_err();
        assert!(matches!(err, EnvstrapError::Validation(_)), "got: {:?}", err);
        assert!(err.to_string().contains("line 1"), "got: {}", err);

        assert!(manifest("libfoo\n--extra-index-url https://x\n").ensure_self_contained().is_ok());
    }

    #[test]
    fn test_digest_tracks_content() {
        assert_eq!(manifest("libfoo\n").digest(), manifest("libfoo\n").digest());
        assert_ne!(manifest("libfoo\n").digest(), manifest("libfoo>=2\n").digest());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("missing.txt")).unwrap();
        let err = DependencyManifest::load(&path).unwrap_err();
        assert!(matches!(err, EnvstrapError::Io { .. }), "got: {:?}", err);
    }
}
