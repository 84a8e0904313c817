/// Errors produced by the registry client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("GET {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("giving up on {digest} after {attempts} attempts: {source}")]
    RetryExhausted {
        digest: String,
        attempts: u32,
        #[source]
        source: Box<OciError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl OciError {
    /// The innermost failure, looking through retry exhaustion.
    pub fn root_cause(&self) -> &OciError {
        match self {
            OciError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
