//! `manifest.json` and `repositories` for the legacy `docker save` layout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use layerport_oci::{Digest, LayerDescriptor};

use crate::Result;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPOSITORIES_FILE: &str = "repositories";

/// Where each layer lives inside the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerLayout {
    /// `<digest>.tar`
    #[default]
    Flat,
    /// `<digest>/layer.tar`
    Directory,
}

impl LayerLayout {
    pub fn layer_path(&self, digest: &Digest) -> String {
        match self {
            LayerLayout::Flat => format!("{}.tar", digest),
            LayerLayout::Directory => format!("{}/layer.tar", digest),
        }
    }
}

pub fn config_path(digest: &Digest) -> String {
    format!("{}.json", digest)
}

/// One image in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// `repositories`: repository name → tag → config digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Repositories(pub BTreeMap<String, BTreeMap<String, String>>);

impl Repositories {
    pub fn insert(&mut self, repository: String, tag: String, config_digest: &Digest) {
        self.0
            .entry(repository)
            .or_default()
            .insert(tag, config_digest.to_string());
    }

    pub fn get(&self, repository: &str, tag: &str) -> Option<&str> {
        self.0.get(repository)?.get(tag).map(String::as_str)
    }
}

/// Split `name[:tag]` at the last colon that follows the last `/`, so a
/// registry port is never mistaken for a tag.  No tag means `latest`.
/// Digest references (`name@sha256:…`) carry no tag.
pub fn split_repo_tag(reference: &str) -> (String, Option<String>) {
    if let Some((name, _digest)) = reference.split_once('@') {
        return (name.to_string(), None);
    }
    let after_last_slash = reference.rfind('/').map(|p| p + 1).unwrap_or(0);
    match reference.rfind(':') {
        Some(colon) if colon >= after_last_slash => (
            reference[..colon].to_string(),
            Some(reference[colon + 1..].to_string()),
        ),
        _ => (reference.to_string(), Some("latest".to_string())),
    }
}

/// Accumulates per-image manifest and repositories entries.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    layout: LayerLayout,
    entries: Vec<ManifestEntry>,
    repositories: Repositories,
}

impl ManifestBuilder {
    pub fn new(layout: LayerLayout) -> Self {
        Self {
            layout,
            entries: Vec::new(),
            repositories: Repositories::default(),
        }
    }

    pub fn layout(&self) -> LayerLayout {
        self.layout
    }

    /// Add one image.  `layers` must be the image's full layer list; the
    /// entry lists every one of them whether or not it was downloaded.
    pub fn add_image(
        &mut self,
        reference: &str,
        config_digest: &Digest,
        layers: &[LayerDescriptor],
    ) -> &ManifestEntry {
        let (repository, tag) = split_repo_tag(reference);
        let repo_tags = match tag {
            Some(tag) => {
                let repo_tag = format!("{}:{}", repository, tag);
                self.repositories.insert(repository, tag, config_digest);
                vec![repo_tag]
            }
            None => Vec::new(),
        };

        let layout = self.layout;
        let mut ordered: Vec<&LayerDescriptor> = layers.iter().collect();
        ordered.sort_by_key(|l| l.index);

        self.entries.push(ManifestEntry {
            config: config_path(config_digest),
            repo_tags,
            layers: ordered
                .into_iter()
                .map(|l| layout.layer_path(&l.digest))
                .collect(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// Write `manifest.json` and `repositories` into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&self.entries)?)?;
        std::fs::write(
            dir.join(REPOSITORIES_FILE),
            serde_json::to_vec(&self.repositories)?,
        )?;
        Ok(())
    }
}
