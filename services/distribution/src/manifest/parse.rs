//! Manifest payload parsing.
//!
//! A manifest body is parsed into one of a small set of shapes keyed on its
//! media type. Anything else is kept as [`ParsedManifest::Unknown`] and stored
//! without extracted references.

use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::Platform;

/// Manifest media types understood by the registry.
pub mod media_types {
    /// OCI image manifest.
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index.
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// Docker image manifest, schema 2.
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list.
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Whether `media_type` names a multi-platform index.
    pub fn is_index(media_type: &str) -> bool {
        matches!(media_type, OCI_INDEX | DOCKER_MANIFEST_LIST)
    }

    /// Whether `media_type` names a single-platform image manifest.
    pub fn is_image(media_type: &str) -> bool {
        matches!(media_type, OCI_MANIFEST | DOCKER_MANIFEST_V2)
    }

    /// Whether the registry extracts references from this media type.
    pub fn is_known(media_type: &str) -> bool {
        is_image(media_type) || is_index(media_type)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    digest: Digest,
    #[serde(default)]
    platform: Option<PlatformSpec>,
}

#[derive(Debug, Deserialize)]
struct PlatformSpec {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    manifests: Vec<Descriptor>,
}

/// References extracted from a manifest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedManifest {
    /// A single-platform image.
    Image {
        /// Config blob digest.
        config: Digest,
        /// Layer digests, in manifest order.
        layers: Vec<Digest>,
    },
    /// A multi-platform index.
    Index {
        /// Child manifest digests, in manifest order.
        manifests: Vec<Digest>,
        /// Platform of the first listed child.
        platform: Option<Platform>,
    },
    /// Valid JSON with a media type we do not interpret.
    Unknown,
}

impl ParsedManifest {
    /// Parse `body` as a manifest of `media_type`.
    ///
    /// The body must be JSON. Known media types must also have the expected
    /// shape, with well-formed digests.
    pub fn parse(media_type: &str, body: &[u8]) -> RegistryResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|err| RegistryError::InvalidManifest(format!("not JSON: {err}")))?;

        if !value.is_object() {
            return Err(RegistryError::InvalidManifest(
                "manifest must be a JSON object".into(),
            ));
        }

        if media_types::is_image(media_type) {
            let manifest: ImageManifest = serde_json::from_value(value)
                .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
            Ok(ParsedManifest::Image {
                config: manifest.config.digest,
                layers: manifest.layers.into_iter().map(|d| d.digest).collect(),
            })
        } else if media_types::is_index(media_type) {
            let index: ImageIndex = serde_json::from_value(value)
                .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
            let platform = index
                .manifests
                .first()
                .and_then(|child| child.platform.as_ref())
                .map(|platform| Platform {
                    architecture: platform.architecture.clone(),
                    os: platform.os.clone(),
                });
            Ok(ParsedManifest::Index {
                manifests: index.manifests.into_iter().map(|d| d.digest).collect(),
                platform,
            })
        } else {
            Ok(ParsedManifest::Unknown)
        }
    }

    /// Digests listed by the manifest: layers for images, children for indexes.
    pub fn layer_digests(&self) -> &[Digest] {
        match self {
            ParsedManifest::Image { layers, .. } => layers,
            ParsedManifest::Index { manifests, .. } => manifests,
            ParsedManifest::Unknown => &[],
        }
    }

    /// The config digest of an image manifest.
    pub fn config_digest(&self) -> Option<&Digest> {
        match self {
            ParsedManifest::Image { config, .. } => Some(config),
            _ => None,
        }
    }

    /// Platform, for indexes whose first entry declares one.
    pub fn platform(&self) -> Option<&Platform> {
        match self {
            ParsedManifest::Index { platform, .. } => platform.as_ref(),
            _ => None,
        }
    }
}

/// Decide the media type of a pushed manifest.
///
/// A specific declared type wins. A missing or generic JSON type falls back to
/// the body's `mediaType` field, then to the body's shape. A declared type that
/// contradicts the body's own `mediaType` is rejected.
pub fn detect_media_type(declared: Option<&str>, body: &[u8]) -> RegistryResult<String> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| RegistryError::InvalidManifest(format!("not JSON: {err}")))?;
    let embedded = value.get("mediaType").and_then(|v| v.as_str());

    let declared = declared
        .map(|d| d.split(';').next().unwrap_or(d).trim())
        .filter(|d| !d.is_empty() && *d != "application/json");

    match (declared, embedded) {
        (Some(declared), Some(embedded)) if declared != embedded => {
            tracing::debug!(%declared, %embedded, "manifest media type mismatch");
            Err(RegistryError::InvalidManifest(format!(
                "declared media type {declared} does not match {embedded}"
            )))
        }
        (Some(declared), _) => Ok(declared.to_string()),
        (None, Some(embedded)) => Ok(embedded.to_string()),
        (None, None) => {
            let detected = if value.get("manifests").is_some() {
                media_types::OCI_INDEX
            } else {
                media_types::OCI_MANIFEST
            };
            Ok(detected.to_string())
        }
    }
}
