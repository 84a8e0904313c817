//! Registry side of layerport: resolves image manifests and downloads blobs
//! with resumable, digest-verified transfers.

pub mod auth;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod layer;
pub mod manifest;
pub mod registry;
pub mod retry;

pub use auth::{BearerToken, BlobAuthenticator, Challenge, Credentials};
pub use digest::Digest;
pub use error::{OciError, Result};
pub use fetch::{BlobFetcher, BlobRequest, DownloadState, FetchOutcome};
pub use layer::LayerDescriptor;
pub use manifest::{ImageConfig, Platform};
pub use registry::{http_client, ImageRef, RegistryClient, RemoteImage};
pub use retry::RetryPolicy;
