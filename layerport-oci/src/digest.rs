use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{OciError, Result};

const READ_BUF_SIZE: usize = 64 * 1024;

/// A content digest such as `sha256:9f86d0…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse `algorithm:hex`.  A bare hex string is taken as sha256, which is
    /// how docker names its per-digest directories on disk.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (algorithm, hex) = match raw.split_once(':') {
            Some((algo, hex)) => (algo, hex),
            None => ("sha256", raw),
        };

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        {
            return Err(OciError::InvalidDigest(raw.to_string()));
        }
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OciError::InvalidDigest(raw.to_string()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex_encode(&Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Stream the file at `path` through SHA-256 and compare against `self`.
    pub async fn verify_file(&self, path: &Path) -> Result<()> {
        if self.algorithm != "sha256" {
            return Err(OciError::InvalidDigest(format!(
                "unsupported digest algorithm {}",
                self.algorithm
            )));
        }

        let actual = sha256_file(path).await?;
        if actual != self.hex {
            return Err(OciError::DigestMismatch {
                expected: self.to_string(),
                actual: format!("sha256:{}", actual),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Hex-encoded SHA-256 of a file, read in fixed-size chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
