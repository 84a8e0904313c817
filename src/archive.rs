//! Packing a working directory into a `docker load`-compatible tar.
//!
//! The directory holds `manifest.json`, `repositories`, the config blob and
//! whichever layer blobs were downloaded.  Layers the target host already
//! has were never fetched, so a manifest entry whose file is absent is
//! skipped with a warning; the archive then only loads on a host that has
//! those layers.  A missing config file or manifest is an error.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::docker_manifest::{ManifestEntry, MANIFEST_FILE, REPOSITORIES_FILE};
use crate::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How layer blobs are written into the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerEncoding {
    /// The blob exactly as the registry served it.
    #[default]
    Compressed,
    /// Gzip blobs are decompressed to a plain tar.
    Uncompressed,
}

/// What ended up in the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub images: usize,
    pub layers_written: usize,
    /// Layer paths listed in the manifest but absent from the directory.
    pub layers_skipped: Vec<String>,
}

pub struct ArchiveAssembler {
    dir: PathBuf,
    encoding: LayerEncoding,
    verified: Option<BTreeSet<String>>,
}

impl ArchiveAssembler {
    pub fn new(dir: impl Into<PathBuf>, encoding: LayerEncoding) -> Self {
        Self {
            dir: dir.into(),
            encoding,
            verified: None,
        }
    }

    /// Pack only these layer paths.  Any other file found at a layer path
    /// (a leftover partial download, say) is treated as absent.
    pub fn with_verified_layers(mut self, layers: impl IntoIterator<Item = String>) -> Self {
        self.verified = Some(layers.into_iter().collect());
        self
    }

    /// Write the archive to `output`, gzip-compressing it when `gzip` is set.
    /// The archive is staged next to `output` and only renamed into place
    /// once complete; on failure nothing is left at `output`.
    pub fn assemble_to_file(&self, output: &Path, gzip: bool) -> Result<AssemblyReport> {
        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let staged = NamedTempFile::new_in(parent).map_err(|e| {
            Error::Archive(format!("failed to stage archive in {}: {}", parent.display(), e))
        })?;
        let writer = io::BufWriter::new(staged);

        let (report, writer) = if gzip {
            let encoder = GzEncoder::new(writer, Compression::default());
            let (report, encoder) = self.assemble(encoder)?;
            (report, encoder.finish()?)
        } else {
            self.assemble(writer)?
        };
        let staged = writer.into_inner().map_err(|e| e.into_error())?;
        staged.persist(output).map_err(|e| {
            Error::Archive(format!("failed to write {}: {}", output.display(), e.error))
        })?;

        info!(
            path = %output.display(),
            layers = report.layers_written,
            skipped = report.layers_skipped.len(),
            "archive written",
        );
        Ok(report)
    }

    /// Stream the archive into `writer` and hand the writer back once the
    /// tar footer is written.
    pub fn assemble<W: Write>(&self, writer: W) -> Result<(AssemblyReport, W)> {
        let manifest_bytes = self.read_required(MANIFEST_FILE)?;
        let entries = parse_manifest(&manifest_bytes)?;
        let repositories = self.read_required(REPOSITORIES_FILE)?;

        let mut builder = Builder::new(writer);
        let mut report = AssemblyReport {
            images: entries.len(),
            ..Default::default()
        };
        let mut written: BTreeSet<String> = BTreeSet::new();
        let mut dirs: BTreeSet<String> = BTreeSet::new();

        for entry in &entries {
            if written.insert(entry.config.clone()) {
                let config = self.read_required(&entry.config)?;
                append_bytes(&mut builder, &entry.config, &config)?;
            }

            for (i, layer) in entry.layers.iter().enumerate() {
                if !written.insert(layer.clone()) {
                    continue;
                }
                let path = self.dir.join(layer);
                let present = path.is_file();
                let verified = self.verified.as_ref().map_or(true, |v| v.contains(layer));
                if !present || !verified {
                    if present {
                        warn!(
                            layer = %layer,
                            position = i,
                            "layer file was not verified this run, leaving it out of the archive",
                        );
                    } else {
                        warn!(
                            layer = %layer,
                            position = i,
                            "layer not present locally (already on target host), leaving it out of the archive",
                        );
                    }
                    report.layers_skipped.push(layer.clone());
                    continue;
                }

                if let Some((parent, _)) = layer.rsplit_once('/') {
                    if dirs.insert(parent.to_string()) {
                        append_dir(&mut builder, parent)?;
                    }
                }
                self.append_layer(&mut builder, layer, &path)?;
                report.layers_written += 1;
                debug!(
                    layer = %layer,
                    progress = format!("{}/{}", i + 1, entry.layers.len()),
                    "layer added",
                );
            }
        }

        append_bytes(&mut builder, MANIFEST_FILE, &manifest_bytes)?;
        append_bytes(&mut builder, REPOSITORIES_FILE, &repositories)?;

        let writer = builder
            .into_inner()
            .map_err(|e| Error::Archive(format!("failed to finish tar stream: {}", e)))?;
        Ok((report, writer))
    }

    fn read_required(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        std::fs::read(&path).map_err(|e| {
            Error::Archive(format!("missing required file {}: {}", path.display(), e))
        })
    }

    fn append_layer<W: Write>(&self, builder: &mut Builder<W>, name: &str, path: &Path) -> Result<()> {
        if self.encoding == LayerEncoding::Uncompressed && is_gzip(path)? {
            // Tar headers need the size up front, so decompress twice.
            let size = io::copy(&mut gz_reader(path)?, &mut io::sink())?;
            let mut header = file_header(size);
            builder.append_data(&mut header, name, gz_reader(path)?)?;
        } else {
            let file = File::open(path)?;
            let size = file.metadata()?.len();
            let mut header = file_header(size);
            builder.append_data(&mut header, name, BufReader::new(file))?;
        }
        Ok(())
    }
}

fn parse_manifest(raw: &[u8]) -> Result<Vec<ManifestEntry>> {
    let entries: Vec<ManifestEntry> = serde_json::from_slice(raw)?;
    if entries.is_empty() {
        return Err(Error::Archive(format!("{} lists no images", MANIFEST_FILE)));
    }
    Ok(entries)
}

fn file_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header
}

fn append_bytes<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = file_header(data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut Builder<W>, name: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    builder.append_data(&mut header, format!("{}/", name), io::empty())?;
    Ok(())
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn gz_reader(path: &Path) -> Result<GzDecoder<BufReader<File>>> {
    Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
}
