//! One export run: resolve, plan, download, describe, pack.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use layerport_oci::{
    http_client, BearerToken, BlobAuthenticator, BlobFetcher, BlobRequest, Credentials, Digest,
    FetchOutcome, ImageConfig, ImageRef, RegistryClient, RemoteImage,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::ArchiveAssembler;
use crate::config::Config;
use crate::docker_manifest::{config_path, ManifestBuilder};
use crate::known::KnownDigests;
use crate::plan::LayerPlan;
use crate::{Error, Result};

/// Summary of a finished export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub image: String,
    pub config_digest: Digest,
    /// Layers the image declares.
    pub total_layers: usize,
    /// Layers transferred over the network this run.
    pub fetched: usize,
    /// Layers already complete in the working directory from an earlier run.
    pub reused: usize,
    /// Layers skipped because the target host already has them.
    pub deduplicated: usize,
    /// Layers listed in `manifest.json` but not packed into the archive.
    pub missing_from_archive: Vec<String>,
    pub archive: PathBuf,
}

/// A resolved image and its layer plan, without any layer transferred.
#[derive(Debug, Clone)]
pub struct PlannedExport {
    pub reference: ImageRef,
    pub config_digest: Digest,
    pub plan: LayerPlan,
}

/// Layers that ended this run verified on disk.
#[derive(Debug, Default)]
struct Downloads {
    fetched: usize,
    reused: usize,
    /// Archive paths of every verified layer.
    verified: Vec<String>,
}

struct Resolved {
    reference: ImageRef,
    token: Arc<BearerToken>,
    image: RemoteImage,
    plan: LayerPlan,
}

pub struct Exporter {
    config: Config,
    registry: RegistryClient,
    fetcher: BlobFetcher,
    credentials: Option<Credentials>,
}

impl Exporter {
    pub fn new(config: Config) -> Result<Self> {
        let client = http_client(config.download.connect_timeout)?;
        Self::with_client(config, client)
    }

    /// Build an exporter around an existing HTTP client.
    pub fn with_client(config: Config, client: reqwest::Client) -> Result<Self> {
        let credentials = config.registry.credentials()?;
        let fetcher = BlobFetcher::new(client.clone(), config.download.retry_policy());
        Ok(Self {
            registry: RegistryClient::new(client),
            fetcher,
            credentials,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Export `image` into the configured archive, skipping layers in
    /// `known`.  The run is bounded by `download.deadline` when set.
    pub async fn export(&self, image: &str, known: &KnownDigests) -> Result<ExportReport> {
        let run_id = Uuid::now_v7();
        let span = info_span!("export", %run_id, image);
        let run = self.run_export(image, known).instrument(span);

        match self.config.download.deadline {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                Error::Timeout(format!(
                    "export of {} did not finish within {}",
                    image,
                    humantime::format_duration(limit)
                ))
            })?,
            None => run.await,
        }
    }

    /// Resolve `image` and compute its layer plan.  Only the config blob is
    /// downloaded.
    pub async fn plan(&self, image: &str, known: &KnownDigests) -> Result<PlannedExport> {
        let run_id = Uuid::now_v7();
        let resolved = self
            .resolve(image, known)
            .instrument(info_span!("plan", %run_id, image))
            .await?;
        Ok(PlannedExport {
            config_digest: resolved.image.config().digest.clone(),
            reference: resolved.reference,
            plan: resolved.plan,
        })
    }

    async fn run_export(&self, image: &str, known: &KnownDigests) -> Result<ExportReport> {
        let resolved = self.resolve(image, known).await?;
        let output_dir = &self.config.download.output_dir;
        let layout = self.config.archive.layout;

        let downloads = self.download_layers(&resolved).await?;

        let config_digest = resolved.image.config().digest.clone();
        let mut manifest = ManifestBuilder::new(layout);
        manifest.add_image(image.trim(), &config_digest, resolved.plan.full());
        manifest.write_to(output_dir)?;
        debug!(dir = %output_dir.display(), "manifest.json and repositories written");

        // Known layers were not checked this run, so a file sitting at their
        // path must not be packed.
        let assembler = ArchiveAssembler::new(output_dir.clone(), self.config.archive.layer_encoding)
            .with_verified_layers(downloads.verified);
        let archive = self.config.archive.output.clone();
        let gzip = self.config.archive.gzip;
        let dest = archive.clone();
        let assembly = tokio::task::spawn_blocking(move || assembler.assemble_to_file(&dest, gzip))
            .await
            .map_err(|e| Error::Archive(format!("assembly task failed: {}", e)))??;

        if !assembly.layers_skipped.is_empty() {
            warn!(
                missing = assembly.layers_skipped.len(),
                "archive omits layers the target host already has; it will not load elsewhere",
            );
        }

        let report = ExportReport {
            image: image.trim().to_string(),
            config_digest,
            total_layers: resolved.plan.full().len(),
            fetched: downloads.fetched,
            reused: downloads.reused,
            deduplicated: resolved.plan.deduplicated_count(),
            missing_from_archive: assembly.layers_skipped,
            archive,
        };
        info!(
            total = report.total_layers,
            fetched = report.fetched,
            reused = report.reused,
            deduplicated = report.deduplicated,
            archive = %report.archive.display(),
            "export complete",
        );
        Ok(report)
    }

    async fn resolve(&self, image: &str, known: &KnownDigests) -> Result<Resolved> {
        let reference = ImageRef::parse(image)?;
        let platform = self.config.download.platform()?;
        let output_dir = &self.config.download.output_dir;
        tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
            Error::Config(format!(
                "failed to create output directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        let token = BlobAuthenticator::new(self.registry.http())
            .with_credentials(self.credentials.as_ref())
            .authenticate(&reference.base_url(), &reference.repository)
            .await?;

        let remote = self
            .registry
            .resolve_image(&reference, &platform, &token)
            .await?;

        let config = self
            .fetch_config(&reference, &remote, &token, output_dir)
            .await?;

        let plan = LayerPlan::new(remote.layers.clone(), known);
        plan.check_declared(config.declared_layer_count())?;

        Ok(Resolved {
            reference,
            token: Arc::new(token),
            image: remote,
            plan,
        })
    }

    async fn fetch_config(
        &self,
        reference: &ImageRef,
        image: &RemoteImage,
        token: &BearerToken,
        output_dir: &Path,
    ) -> Result<ImageConfig> {
        let desc = image.config();
        let dest = output_dir.join(config_path(&desc.digest));
        let url = reference.blob_url(&desc.digest);
        let req = BlobRequest {
            url: &url,
            digest: &desc.digest,
            size: desc.size,
            dest: &dest,
        };
        self.fetcher.fetch(&req, token).await?;

        let raw = tokio::fs::read(&dest).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Download every planned layer with at most `download.concurrency`
    /// transfers in flight.  The first failure aborts the remaining
    /// transfers; their partial files stay on disk.
    async fn download_layers(&self, resolved: &Resolved) -> Result<Downloads> {
        let output_dir = &self.config.download.output_dir;
        let layout = self.config.archive.layout;
        let permits = Arc::new(Semaphore::new(self.config.download.concurrency));
        let total = resolved.plan.fetch_count();

        let mut join_set = JoinSet::new();
        for layer in resolved.plan.to_fetch() {
            let fetcher = self.fetcher.clone();
            let token = Arc::clone(&resolved.token);
            let permits = Arc::clone(&permits);
            let url = resolved.reference.blob_url(&layer.digest);
            let name = layout.layer_path(&layer.digest);
            let dest = output_dir.join(&name);
            let layer = layer.clone();

            join_set.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                    let req = BlobRequest {
                        url: &url,
                        digest: &layer.digest,
                        size: layer.size,
                        dest: &dest,
                    };
                    let outcome = fetcher.fetch(&req, &token).await?;
                    Ok::<_, Error>((layer.index, name, outcome))
                }
                .in_current_span(),
            );
        }

        let mut downloads = Downloads::default();
        while let Some(joined) = join_set.join_next().await {
            let result = joined
                .map_err(|e| Error::Io(std::io::Error::other(format!("download task failed: {}", e))))
                .and_then(|r| r);
            let (index, name, outcome) = match result {
                Ok(done) => done,
                Err(e) => {
                    join_set.abort_all();
                    return Err(e);
                }
            };
            match outcome {
                FetchOutcome::AlreadyPresent => downloads.reused += 1,
                FetchOutcome::Downloaded { .. } => downloads.fetched += 1,
            }
            downloads.verified.push(name);
            info!(
                layer = index,
                progress = format!("{}/{}", downloads.verified.len(), total),
                "layer ready",
            );
        }

        Ok(downloads)
    }
}
