//! Resumable, digest-verified blob downloads.
//!
//! Progress lives only on disk: every attempt re-derives its starting offset
//! from the size of the destination file, so an interrupted run picks up
//! where the previous one stopped.  A file is only ever reported complete
//! after its SHA-256 matches the expected digest.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::auth::BearerToken;
use crate::digest::Digest;
use crate::error::{OciError, Result};
use crate::retry::RetryPolicy;

/// What to download and where to put it.
#[derive(Debug, Clone, Copy)]
pub struct BlobRequest<'a> {
    pub url: &'a str,
    pub digest: &'a Digest,
    pub size: u64,
    pub dest: &'a Path,
}

/// Snapshot of a destination file relative to its expected size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadState {
    pub expected: u64,
    pub on_disk: u64,
    pub exists: bool,
}

impl DownloadState {
    pub async fn inspect(dest: &Path, expected: u64) -> Result<Self> {
        let (on_disk, exists) = match fs::metadata(dest).await {
            Ok(meta) => (meta.len(), true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, false),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            expected,
            on_disk,
            exists,
        })
    }

    /// A missing file is never complete, not even for an empty blob.
    pub fn is_complete(&self) -> bool {
        self.exists && self.on_disk == self.expected
    }

    pub fn is_overlong(&self) -> bool {
        self.on_disk > self.expected
    }
}

/// How a successful fetch was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A verified copy was already on disk; no request was made.
    AlreadyPresent,
    /// Bytes were transferred, starting at `resumed_from`.
    Downloaded { resumed_from: u64 },
}

/// Downloads blobs with range-resume, digest verification and retries.
#[derive(Debug, Clone)]
pub struct BlobFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl BlobFetcher {
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `req.url` into `req.dest`.  On success the destination holds
    /// exactly `req.size` bytes hashing to `req.digest`.  On failure the
    /// partial file is left in place for a later resume.
    pub async fn fetch(&self, req: &BlobRequest<'_>, token: &BearerToken) -> Result<FetchOutcome> {
        if req.digest.algorithm() != "sha256" {
            return Err(OciError::InvalidDigest(format!(
                "cannot verify {} digests",
                req.digest.algorithm()
            )));
        }
        if let Some(parent) = req.dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut failures: u32 = 0;
        let mut resumed_from: Option<u64> = None;

        loop {
            let state = DownloadState::inspect(req.dest, req.size).await?;

            let step = if state.is_complete() {
                match req.digest.verify_file(req.dest).await {
                    Ok(()) => {
                        return Ok(match resumed_from {
                            None => {
                                debug!(digest = %req.digest, "blob already present and verified");
                                FetchOutcome::AlreadyPresent
                            }
                            Some(offset) => {
                                info!(digest = %req.digest, bytes = req.size, "blob downloaded");
                                FetchOutcome::Downloaded {
                                    resumed_from: offset,
                                }
                            }
                        });
                    }
                    Err(err @ OciError::DigestMismatch { .. }) => {
                        warn!(
                            digest = %req.digest,
                            path = %req.dest.display(),
                            error = %err,
                            "discarding blob with wrong digest",
                        );
                        fs::remove_file(req.dest).await?;
                        if resumed_from.is_none() {
                            // Stale file from an earlier run; not a failure of this fetch.
                            continue;
                        }
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            } else {
                let offset = if state.is_overlong() {
                    warn!(
                        digest = %req.digest,
                        on_disk = state.on_disk,
                        expected = state.expected,
                        "partial file larger than blob, starting over",
                    );
                    truncate_to_zero(req.dest).await?;
                    0
                } else {
                    state.on_disk
                };
                resumed_from.get_or_insert(offset);
                self.transfer(req, token, offset).await
            };

            if let Err(err) = step {
                failures += 1;
                if !self.policy.allows_retry(failures) {
                    return Err(OciError::RetryExhausted {
                        digest: req.digest.to_string(),
                        attempts: failures,
                        source: Box::new(err),
                    });
                }
                let delay = self.policy.backoff(failures);
                warn!(
                    digest = %req.digest,
                    attempt = failures,
                    max_attempts = self.policy.max_attempts(),
                    delay = ?delay,
                    error = %err,
                    "blob fetch attempt failed, retrying",
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// One HTTP round trip.  The response and file handle are both released
    /// when this returns.
    async fn transfer(&self, req: &BlobRequest<'_>, token: &BearerToken, offset: u64) -> Result<()> {
        let mut builder = token.authorize(self.client.get(req.url));
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }

        debug!(digest = %req.digest, offset, "requesting blob");
        let resp = builder.send().await?;
        let status = resp.status();

        let (mut file, mut written) = match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(start) = content_range_start(resp.headers()) {
                    if start != offset {
                        return Err(OciError::Transfer(format!(
                            "asked for bytes from {} but server sent from {}",
                            offset, start
                        )));
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(req.dest)
                    .await?;
                (file, offset)
            }
            StatusCode::OK => {
                if offset > 0 {
                    info!(digest = %req.digest, offset, "server ignored range request, restarting from zero");
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(req.dest)
                    .await?;
                (file, 0)
            }
            StatusCode::NOT_FOUND => return Err(OciError::NotFound(req.url.to_string())),
            _ => {
                return Err(OciError::Status {
                    url: req.url.to_string(),
                    status,
                })
            }
        };

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written > req.size {
                file.flush().await?;
                return Err(OciError::Transfer(format!(
                    "received {} bytes for a {} byte blob",
                    written, req.size
                )));
            }
        }
        file.flush().await?;

        if written < req.size {
            return Err(OciError::Transfer(format!(
                "stream ended after {} of {} bytes",
                written, req.size
            )));
        }
        Ok(())
    }
}

async fn truncate_to_zero(path: &Path) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(0).await?;
    Ok(())
}

/// Start offset from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_start(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
