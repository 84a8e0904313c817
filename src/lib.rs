//! layerport: incremental container image export.
//!
//! Pulls an image from a registry and packs it as a `docker load`
//! compatible tar, skipping layers whose digests the target host already
//! has.  The archive's `manifest.json` always lists every layer of the
//! image; only the tar entries for known layers are left out.
//!
//! # Example
//!
//! ```no_run
//! use layerport::{config::Config, export::Exporter, known::KnownDigests};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut known = KnownDigests::new();
//!     known.insert_str("sha256:3f1a9c0d7e52b4a8")?;
//!
//!     let exporter = Exporter::new(Config::default())?;
//!     let report = exporter.export("ghcr.io/acme/api:1.4", &known).await?;
//!
//!     println!("fetched {} of {} layers", report.fetched, report.total_layers);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod docker_manifest;
pub mod error;
pub mod export;
pub mod known;
pub mod logging;
pub mod plan;

pub use error::{Error, ErrorKind, Result};
