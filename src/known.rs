//! Digests of layers the target host already has.
//!
//! How the host is queried is not this crate's business; the set arrives as
//! text with one digest per line (the listing of docker's
//! `distribution/diffid-by-digest/sha256` directory works as-is) or as
//! individual values from the command line.

use std::collections::HashSet;
use std::path::Path;

use layerport_oci::Digest;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct KnownDigests {
    digests: HashSet<Digest>,
}

impl KnownDigests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse newline-separated digests.  Blank lines are skipped and lines
    /// that are not digests are logged and ignored.
    pub fn from_lines(text: &str) -> Self {
        let mut known = Self::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Digest::parse(line) {
                Ok(d) => {
                    known.digests.insert(d);
                }
                Err(_) => warn!(line, "ignoring malformed known digest"),
            }
        }
        known
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read known digests {}: {}",
                path.display(),
                e
            ))
        })?;
        let known = Self::from_lines(&text);
        debug!(path = %path.display(), count = known.len(), "loaded known digests");
        Ok(known)
    }

    /// Add one digest given on the command line; unlike file input a bad
    /// value is an error.
    pub fn insert_str(&mut self, raw: &str) -> Result<()> {
        let digest = Digest::parse(raw)
            .map_err(|e| Error::Config(format!("invalid --known-digest '{}': {}", raw, e)))?;
        self.digests.insert(digest);
        Ok(())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl FromIterator<Digest> for KnownDigests {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        Self {
            digests: iter.into_iter().collect(),
        }
    }
}
