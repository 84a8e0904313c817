use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::digest::Digest;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Image Manifest
// ---------------------------------------------------------------------------

/// A single-platform image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default)]
    pub platform: Option<Platform>,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// Parse `os/arch` or `os/arch/variant` (e.g. `linux/arm64/v8`).
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                architecture: arch.to_string(),
                os: os.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    architecture: arch.to_string(),
                    os: os.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(OciError::Manifest(format!(
                "invalid platform '{}', expected os/arch[/variant]",
                raw
            ))),
        }
    }

    fn matches(&self, candidate: &Platform) -> bool {
        candidate.os == self.os
            && candidate.architecture == self.architecture
            && (self.variant.is_none() || candidate.variant == self.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index or Docker manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches `target`.  When nothing
    /// matches, the first entry is used so that single-arch images published
    /// as an index still export.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        let exact = self
            .manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| target.matches(p)));
        if let Some(desc) = exact {
            return Ok(desc);
        }

        let first = self.manifests.first().ok_or_else(|| {
            OciError::Manifest("image index contains no manifests".to_string())
        })?;
        warn!(
            requested = %target,
            chosen = %first
                .platform
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            "no manifest for requested platform, falling back to first entry",
        );
        Ok(first)
    }
}

// ---------------------------------------------------------------------------
// Image Config
// ---------------------------------------------------------------------------

/// The parts of the image configuration blob this crate inspects.  The blob
/// itself is always exported byte-for-byte.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: Option<String>,

    #[serde(default)]
    pub os: Option<String>,

    #[serde(default)]
    pub rootfs: Option<RootFs>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl ImageConfig {
    /// Number of layers the config declares, if it declares any.
    pub fn declared_layer_count(&self) -> Option<usize> {
        self.rootfs.as_ref().map(|r| r.diff_ids.len())
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:aaaa",
            "size": 1234
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:bbbb",
                "size": 5678
            },
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:cccc",
                "size": 91011
            }
        ]
    }"#;

    #[test]
    fn parse_manifest() {
        let m: OciManifest = serde_json::from_str(SAMPLE_MANIFEST).unwrap();
        assert_eq!(m.schema_version, 2);
        assert_eq!(m.config.digest.to_string(), "sha256:aaaa");
        assert_eq!(m.layers.len(), 2);
        assert_eq!(m.layers[0].digest.hex(), "bbbb");
        assert_eq!(m.layers[1].size, 91011);
    }

    const SAMPLE_INDEX: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:a0d64",
                "size": 100,
                "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:a64a64",
                "size": 200,
                "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
            }
        ]
    }"#;

    #[test]
    fn select_platform_amd64() {
        let idx: ImageIndex = serde_json::from_str(SAMPLE_INDEX).unwrap();
        let desc = idx
            .select_platform(&Platform::parse("linux/amd64").unwrap())
            .unwrap();
        assert_eq!(desc.digest.hex(), "a0d64");
    }

    #[test]
    fn select_platform_with_variant() {
        let idx: ImageIndex = serde_json::from_str(SAMPLE_INDEX).unwrap();
        let desc = idx
            .select_platform(&Platform::parse("linux/arm64/v8").unwrap())
            .unwrap();
        assert_eq!(desc.digest.hex(), "a64a64");
    }

    #[test]
    fn select_platform_falls_back_to_first() {
        let idx: ImageIndex = serde_json::from_str(SAMPLE_INDEX).unwrap();
        let desc = idx
            .select_platform(&Platform::parse("linux/s390x").unwrap())
            .unwrap();
        assert_eq!(desc.digest.hex(), "a0d64");
    }

    #[test]
    fn select_platform_empty_index() {
        let idx = ImageIndex {
            schema_version: 2,
            manifests: Vec::new(),
        };
        assert!(idx.select_platform(&Platform::default()).is_err());
    }

    #[test]
    fn platform_parse_and_display() {
        let p = Platform::parse("linux/arm/v7").unwrap();
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux//v7").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
    }

    #[test]
    fn config_declared_layers() {
        let cfg: ImageConfig = serde_json::from_str(
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:1","sha256:2"]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.declared_layer_count(), Some(2));

        let bare: ImageConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(bare.declared_layer_count(), None);
    }

    #[test]
    fn media_type_helpers() {
        assert!(is_index_media_type(MEDIA_TYPE_OCI_INDEX));
        assert!(is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(!is_index_media_type(MEDIA_TYPE_OCI_MANIFEST));
        assert!(!is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST));
    }
}
