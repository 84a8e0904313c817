use std::time::Duration;

use crate::auth::BearerToken;
use crate::digest::Digest;
use crate::error::{OciError, Result};
use crate::layer::LayerDescriptor;
use crate::manifest::{
    self, Descriptor, ImageIndex, OciManifest, Platform, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tracing::{debug, info};

const DOCKER_HUB: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Registry("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', otherwise it is
            // a registry port ("localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(OciError::Registry(format!(
                "invalid image reference '{}'",
                raw
            )));
        }

        // The first component is a registry host when it contains a dot or
        // a port, or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// `scheme://host` for this reference's registry.
    pub fn base_url(&self) -> String {
        format!("{}://{}", registry_scheme(&self.registry), self.registry)
    }

    pub fn blob_url(&self, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(),
            self.repository,
            digest
        )
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(),
            self.repository,
            reference
        )
    }
}

/// Return the URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

// ---------------------------------------------------------------------------
// RemoteImage
// ---------------------------------------------------------------------------

/// A single-platform image as the registry describes it.
#[derive(Debug, Clone)]
pub struct RemoteImage {
    pub reference: ImageRef,
    pub manifest: OciManifest,
    pub layers: Vec<LayerDescriptor>,
}

impl RemoteImage {
    pub fn config(&self) -> &Descriptor {
        &self.manifest.config
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Build the HTTP client shared by every registry request of a run.
pub fn http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("layerport/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(connect_timeout)
        .build()?;
    Ok(client)
}

/// Manifest lookups against the distribution API.  The transport is passed
/// in so that callers and tests decide how it is configured.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch the manifest (or image index) for `image_ref`.
    pub async fn fetch_manifest(
        &self,
        image_ref: &ImageRef,
        token: &BearerToken,
    ) -> Result<ManifestResponse> {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let body = self
            .get(&image_ref.manifest_url(&image_ref.reference), token, &accept)
            .await?;

        // Peek at the response to decide which type to deserialize.
        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if manifest::is_index_media_type(media_type) || raw.get("manifests").is_some() {
            let idx: ImageIndex = serde_json::from_value(raw)?;
            Ok(ManifestResponse::Index(idx))
        } else if raw.get("layers").is_some() {
            let m: OciManifest = serde_json::from_value(raw)?;
            Ok(ManifestResponse::Manifest(m))
        } else {
            Err(OciError::Manifest(format!(
                "unsupported manifest (mediaType '{}')",
                media_type
            )))
        }
    }

    /// Fetch a single manifest by its digest (used after resolving an index).
    pub async fn fetch_manifest_by_digest(
        &self,
        image_ref: &ImageRef,
        digest: &Digest,
        token: &BearerToken,
    ) -> Result<OciManifest> {
        let accept = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", ");
        let body = self
            .get(&image_ref.manifest_url(&digest.to_string()), token, &accept)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Resolve `image_ref` to a concrete single-platform image, selecting
    /// from an index when the registry returns one.
    pub async fn resolve_image(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
        token: &BearerToken,
    ) -> Result<RemoteImage> {
        let manifest = match self.fetch_manifest(image_ref, token).await? {
            ManifestResponse::Manifest(m) => m,
            ManifestResponse::Index(idx) => {
                let desc = idx.select_platform(platform)?;
                info!(digest = %desc.digest, %platform, "resolved platform manifest");
                self.fetch_manifest_by_digest(image_ref, &desc.digest, token)
                    .await?
            }
        };

        let layers = LayerDescriptor::from_descriptors(&manifest.layers);
        debug!(
            config = %manifest.config.digest,
            layers = layers.len(),
            "image manifest resolved",
        );
        Ok(RemoteImage {
            reference: image_ref.clone(),
            manifest,
            layers,
        })
    }

    async fn get(&self, url: &str, token: &BearerToken, accept: &str) -> Result<Vec<u8>> {
        let resp = token
            .authorize(self.client.get(url))
            .header(ACCEPT, accept)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OciError::Auth(format!(
                "GET {} returned {}",
                url,
                resp.status()
            ))),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(OciError::Registry(format!(
                    "GET {} returned {}: {}",
                    url, status, body
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ManifestResponse
// ---------------------------------------------------------------------------

/// The result of fetching a manifest endpoint: either a single manifest or
/// an image index that must be further resolved.
pub enum ManifestResponse {
    Manifest(OciManifest),
    Index(ImageIndex),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn parse_simple_name() {
        let r = ImageRef::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parse_ghcr() {
        let r = ImageRef::parse("ghcr.io/foo/bar:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "foo/bar");
        assert_eq!(r.reference, "v1");
    }

    #[test]
    fn parse_digest_reference() {
        let r = ImageRef::parse("my.registry.io/org/repo@sha256:abc123").unwrap();
        assert_eq!(r.registry, "my.registry.io");
        assert_eq!(r.repository, "org/repo");
        assert_eq!(r.reference, "sha256:abc123");
    }

    #[test]
    fn parse_docker_hub_user_repo() {
        let r = ImageRef::parse("myuser/myrepo:v2").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "myuser/myrepo");
        assert_eq!(r.reference, "v2");
    }

    #[test]
    fn parse_registry_with_port() {
        let r = ImageRef::parse("localhost:5000/myrepo:tag").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myrepo");
        assert_eq!(r.reference, "tag");
        assert_eq!(r.base_url(), "http://localhost:5000");
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("repo:").is_err());
        assert!(ImageRef::parse("@sha256:abc").is_err());
    }

    #[test]
    fn blob_url_layout() {
        let r = ImageRef::parse("docker.example.com/platform/app:1.0").unwrap();
        let d = Digest::parse("sha256:beef").unwrap();
        assert_eq!(
            r.blob_url(&d),
            "https://docker.example.com/v2/platform/app/blobs/sha256:beef"
        );
    }

    #[test]
    fn registry_scheme_by_host() {
        assert_eq!(registry_scheme("localhost"), "http");
        assert_eq!(registry_scheme("127.0.0.1:5000"), "http");
        assert_eq!(registry_scheme("ghcr.io"), "https");
        assert_eq!(registry_scheme("my.registry.io:443"), "https");
    }

    #[tokio::test]
    async fn resolve_image_through_index() {
        let server = MockServer::start_async().await;
        let host = server.address().to_string();

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/team/app/manifests/v1");
                then.status(200).body(
                    r#"{"schemaVersion":2,
                        "mediaType":"application/vnd.oci.image.index.v1+json",
                        "manifests":[
                          {"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:0a","size":1,
                           "platform":{"architecture":"arm64","os":"linux"}},
                          {"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:0b","size":1,
                           "platform":{"architecture":"amd64","os":"linux"}}]}"#,
                );
            })
            .await;
        let by_digest = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/team/app/manifests/sha256:0b");
                then.status(200).body(
                    r#"{"schemaVersion":2,
                        "config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:c0","size":2},
                        "layers":[
                          {"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"sha256:01","size":3},
                          {"mediaType":"application/vnd.oci.image.layer.v1.tar+gzip","digest":"sha256:02","size":4}]}"#,
                );
            })
            .await;

        let image_ref = ImageRef::parse(&format!("{}/team/app:v1", host)).unwrap();
        let client = RegistryClient::new(reqwest::Client::new());
        let token = BearerToken::anonymous("repository:team/app:pull".to_string());
        let image = client
            .resolve_image(&image_ref, &Platform::default(), &token)
            .await
            .unwrap();

        by_digest.assert_async().await;
        assert_eq!(image.config().digest.hex(), "c0");
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[1].index, 1);
        assert_eq!(image.layers[1].digest.hex(), "02");
    }

    #[tokio::test]
    async fn missing_manifest_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/team/app/manifests/nope");
                then.status(404);
            })
            .await;

        let image_ref =
            ImageRef::parse(&format!("{}/team/app:nope", server.address())).unwrap();
        let client = RegistryClient::new(reqwest::Client::new());
        let token = BearerToken::anonymous(String::new());
        let err = client
            .fetch_manifest(&image_ref, &token)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OciError::NotFound(_)));
    }
}
