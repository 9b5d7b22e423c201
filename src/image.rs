//! Image references.
//!
//! - [`BaseImage`]: the externally supplied, versioned starting image
//! - [`ImageId`]: the content-addressable identity an engine assigns to a layer
//! - [`Digest`]: SHA-256 digest used to fingerprint build inputs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::EnvstrapError;

const DIGEST_ALGORITHM: &str = "sha256";

/// How a base image is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    /// A mutable tag such as `2.3-cuda12`.
    Tag(String),
    /// An immutable digest such as `sha256:4f...`.
    Digest(String),
}

/// A versioned reference to a pre-built runtime image.
///
/// Parsed from `name:tag` or `name@sha256:<hex>`. A bare name is rejected:
/// an implicit `latest` cannot be reproduced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseImage {
    name: String,
    reference: ImageReference,
}

impl BaseImage {
    /// Repository name, including any registry host.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Returns true when the image is pinned by digest.
    pub fn is_pinned(&self) -> bool {
        matches!(self.reference, ImageReference::Digest(_))
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            ImageReference::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            ImageReference::Digest(digest) => write!(f, "{}@{}", self.name, digest),
        }
    }
}

fn validate_repository(name: &str, input: &str) -> Result<(), EnvstrapError> {
    if name.is_empty() {
        return Err(EnvstrapError::Validation(format!(
            "image reference '{}' has an empty repository name",
            input
        )));
    }
    if name.starts_with('-') || name.chars().any(|c| c.is_whitespace()) {
        return Err(EnvstrapError::Validation(format!(
            "image reference '{}' has an invalid repository name",
            input
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str, input: &str) -> Result<(), EnvstrapError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(&['.', '-'][..])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(EnvstrapError::Validation(format!(
            "image reference '{}' has an invalid tag '{}'",
            input, tag
        )));
    }
    Ok(())
}

fn validate_digest(digest: &str, input: &str) -> Result<(), EnvstrapError> {
    let valid = digest
        .strip_prefix(DIGEST_ALGORITHM)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|hex| {
            hex.len() == 64 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        });
    if !valid {
        return Err(EnvstrapError::Validation(format!(
            "image reference '{}' has an invalid digest; expected sha256:<64 hex chars>",
            input
        )));
    }
    Ok(())
}

impl FromStr for BaseImage {
    type Err = EnvstrapError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();

        if let Some((name, digest)) = input.split_once('@') {
            validate_repository(name, input)?;
            validate_digest(digest, input)?;
            return Ok(Self {
                name: name.to_string(),
                reference: ImageReference::Digest(digest.to_string()),
            });
        }

        // A ':' before the last '/' belongs to a registry port, not a tag.
        let last_segment_start = input.rfind('/').map_or(0, |i| i + 1);
        let Some(colon) = input[last_segment_start..].rfind(':') else {
            return Err(EnvstrapError::Validation(format!(
                "image reference '{}' must be pinned with a tag or digest",
                input
            )));
        };
        let (name, tag) = input.split_at(last_segment_start + colon);
        let tag = &tag[1..];
        validate_repository(name, input)?;
        validate_tag(tag, input)?;

        Ok(Self {
            name: name.to_string(),
            reference: ImageReference::Tag(tag.to_string()),
        })
    }
}

impl Serialize for BaseImage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BaseImage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of an image or layer as reported by the engine.
///
/// Engines report content-addressable ids (`sha256:...`); the value is
/// otherwise opaque to the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Computes the digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&Sha256::digest(data));
        Self(bytes)
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", DIGEST_ALGORITHM, self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Incremental digest over length-prefixed fields.
///
/// Each field is prefixed with its length so `["ab", "c"]` and `["a", "bc"]`
/// hash differently.
pub struct DigestBuilder(Sha256);

impl DigestBuilder {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, field: &[u8]) -> &mut Self {
        self.0.update((field.len() as u64).to_le_bytes());
        self.0.update(field);
        self
    }

    pub fn finish(self) -> Digest {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.finalize());
        Digest(bytes)
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
