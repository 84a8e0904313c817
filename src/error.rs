//! Error types for layerport

use layerport_oci::OciError;
use thiserror::Error;

/// Result type alias using layerport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during an export run
#[derive(Error, Debug)]
pub enum Error {
    /// Registry, authentication and blob transfer errors
    #[error(transparent)]
    Oci(#[from] OciError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layer planning errors
    #[error("Plan error: {0}")]
    Plan(String),

    /// Archive assembly errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// Run deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Run cancelled by the operator
    #[error("Cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Stable tag identifying the category of a failure, printed alongside the
/// message when a run aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    ImageParse,
    ImageDownload,
    FileOperation,
    Network,
    Auth,
    Checksum,
    TarAssembly,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::ImageParse => "IMAGE_PARSE_FAILED",
            ErrorKind::ImageDownload => "IMAGE_DOWNLOAD_FAILED",
            ErrorKind::FileOperation => "FILE_OPERATION_FAILED",
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Auth => "AUTH_ERROR",
            ErrorKind::Checksum => "CHECKSUM_ERROR",
            ErrorKind::TarAssembly => "TAR_ASSEMBLY_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Oci(e) => oci_kind(e),
            Error::Config(_) | Error::Yaml(_) => ErrorKind::Config,
            Error::Plan(_) | Error::Json(_) => ErrorKind::ImageParse,
            Error::Archive(_) => ErrorKind::TarAssembly,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::FileOperation,
        }
    }
}

fn oci_kind(e: &OciError) -> ErrorKind {
    match e {
        OciError::RetryExhausted { .. } => ErrorKind::ImageDownload,
        OciError::Auth(_) => ErrorKind::Auth,
        OciError::DigestMismatch { .. } => ErrorKind::Checksum,
        OciError::Manifest(_)
        | OciError::Json(_)
        | OciError::InvalidDigest(_)
        | OciError::Registry(_)
        | OciError::NotFound(_) => ErrorKind::ImageParse,
        OciError::Http(_) | OciError::Status { .. } | OciError::Transfer(_) => ErrorKind::Network,
        OciError::Io(_) => ErrorKind::FileOperation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Config("x".into()).kind().as_str(), "CONFIG_ERROR");
        assert_eq!(Error::Archive("x".into()).kind().as_str(), "TAR_ASSEMBLY_FAILED");

        let exhausted = Error::from(OciError::RetryExhausted {
            digest: "sha256:00".into(),
            attempts: 5,
            source: Box::new(OciError::Transfer("reset".into())),
        });
        assert_eq!(exhausted.kind(), ErrorKind::ImageDownload);

        let auth = Error::from(OciError::Auth("denied".into()));
        assert_eq!(auth.kind().to_string(), "AUTH_ERROR");
    }
}
